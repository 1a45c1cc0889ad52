//! Suspension-point guard: every external call races the invocation's cancellation
//! token and an optional timeout.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

pub async fn guarded<F: Future>(cancel: &CancellationToken, timeout: Option<Duration>, fut: F) -> Result<F::Output, Interrupt> {
    let bounded = async {
        match timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Interrupt::TimedOut(d)),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        out = bounded => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_when_quiet() {
        let token = CancellationToken::new();
        assert_eq!(guarded(&token, None, async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn cancelled_token_fails_fast() {
        let token = CancellationToken::new();
        token.cancel();
        let slow = tokio::time::sleep(Duration::from_secs(30));
        let started = std::time::Instant::now();
        assert_eq!(guarded(&token, None, slow).await, Err(Interrupt::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn timeout_interrupts_hung_call() {
        let token = CancellationToken::new();
        let d = Duration::from_millis(20);
        let out = guarded(&token, Some(d), tokio::time::sleep(Duration::from_secs(30))).await;
        assert_eq!(out, Err(Interrupt::TimedOut(d)));
    }
}
