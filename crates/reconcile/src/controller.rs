//! Controller loop: turns change notifications and requeue timers into reconcile passes.
//!
//! - a key waits in the queue at most once (coalesced)
//! - a key is never reconciled by two tasks at once; notifications that arrive while it
//!   is in flight are replayed after it finishes
//! - up to `concurrency` distinct keys run in parallel

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crust_core::ObjectKey;
use crust_store::Coalescer;
use futures::{FutureExt, StreamExt};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::{Outcome, ReconcileConfig, ReconcileError, Reconciler, Requeue};

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub reconciled: u64,
    pub failed: u64,
}

enum Done {
    Reconciled(Outcome),
    Failed(ReconcileError),
    Crashed,
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    concurrency: usize,
    retry_interval: Duration,
}

/// Keys with a running task, indexed by task id so an aborted task still frees its key.
#[derive(Default)]
struct InFlight {
    by_task: FxHashMap<task::Id, ObjectKey>,
    keys: FxHashSet<ObjectKey>,
}

impl InFlight {
    fn start(&mut self, id: task::Id, key: ObjectKey) {
        self.keys.insert(key.clone());
        self.by_task.insert(id, key);
    }

    fn finish(&mut self, id: task::Id) -> Option<ObjectKey> {
        let key = self.by_task.remove(&id)?;
        self.keys.remove(&key);
        Some(key)
    }

    fn contains(&self, key: &ObjectKey) -> bool { self.keys.contains(key) }
}

struct Timers {
    queue: DelayQueue<ObjectKey>,
    keys: FxHashMap<ObjectKey, delay_queue::Key>,
}

impl Timers {
    fn new() -> Self { Self { queue: DelayQueue::new(), keys: FxHashMap::default() } }

    /// Arm (or re-arm) the single timer for `key`.
    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        match self.keys.get(&key) {
            Some(tk) => self.queue.reset(tk, after),
            None => {
                let tk = self.queue.insert(key.clone(), after);
                self.keys.insert(key, tk);
            }
        }
    }

    fn cancel(&mut self, key: &ObjectKey) {
        if let Some(tk) = self.keys.remove(key) {
            self.queue.remove(&tk);
        }
    }

    fn is_empty(&self) -> bool { self.keys.is_empty() }
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, cfg: &ReconcileConfig) -> Self {
        Self { reconciler, concurrency: cfg.concurrency.max(1), retry_interval: cfg.retry_interval }
    }

    /// Run until `shutdown` fires, or until `feed` closes and no work is left.
    /// Timers still armed when the feed closes are dropped.
    pub async fn run(self, mut feed: mpsc::Receiver<ObjectKey>, shutdown: CancellationToken) -> ControllerStats {
        let mut pending: Coalescer<ObjectKey> = Coalescer::new();
        let mut in_flight = InFlight::default();
        let mut timers = Timers::new();
        let mut tasks: JoinSet<Done> = JoinSet::new();
        let mut stats = ControllerStats::default();
        let mut feed_open = true;
        info!(concurrency = self.concurrency, "controller started");

        loop {
            while tasks.len() < self.concurrency {
                let Some(key) = pending.pop_where(|k| !in_flight.contains(k)) else { break };
                let reconciler = Arc::clone(&self.reconciler);
                let token = shutdown.child_token();
                let started = key.clone();
                let handle = tasks.spawn(async move {
                    match AssertUnwindSafe(reconciler.reconcile(&key, &token)).catch_unwind().await {
                        Ok(Ok(outcome)) => Done::Reconciled(outcome),
                        Ok(Err(e)) => Done::Failed(e),
                        Err(_) => Done::Crashed,
                    }
                });
                in_flight.start(handle.id(), started);
            }
            gauge!("crust_queue_depth", pending.len() as f64);

            if !feed_open && tasks.is_empty() && pending.is_empty() {
                debug!("feed closed and queue drained");
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(in_flight = tasks.len(), "shutdown requested");
                    break;
                }
                maybe = feed.recv(), if feed_open => match maybe {
                    Some(key) => {
                        timers.cancel(&key);
                        pending.push(key);
                    }
                    None => {
                        debug!("change feed closed");
                        feed_open = false;
                    }
                },
                Some(expired) = timers.queue.next(), if !timers.is_empty() => {
                    let key = expired.into_inner();
                    timers.keys.remove(&key);
                    pending.push(key);
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let (id, res) = match joined {
                        Ok((id, done)) => (id, done),
                        Err(e) => {
                            error!(error = %e, "reconcile task aborted");
                            (e.id(), Done::Crashed)
                        }
                    };
                    let Some(key) = in_flight.finish(id) else { continue };
                    let after = match res {
                        Done::Reconciled(outcome) => {
                            stats.reconciled += 1;
                            match outcome.requeue {
                                Requeue::After(d) => Some(d),
                                Requeue::None => None,
                            }
                        }
                        Done::Failed(e) => {
                            stats.failed += 1;
                            counter!("crust_reconcile_errors_total", 1u64, "kind" => e.kind().as_str());
                            warn!(%key, error = %e, kind = %e.kind(), retry_in = ?self.retry_interval, "reconcile failed");
                            Some(self.retry_interval)
                        }
                        Done::Crashed => {
                            stats.failed += 1;
                            error!(%key, retry_in = ?self.retry_interval, "reconcile task crashed");
                            Some(self.retry_interval)
                        }
                    };
                    // Work already queued for the key will compute its own requeue.
                    if let Some(d) = after.filter(|_| !pending.contains(&key)) {
                        timers.schedule(key, d);
                    }
                }
            }
        }

        shutdown.cancel();
        while let Some(joined) = tasks.join_next_with_id().await {
            if let Ok((id, Done::Failed(e))) = joined {
                let key = in_flight.finish(id);
                debug!(key = ?key, error = %e, "in-flight reconcile ended during shutdown");
            }
        }
        info!(reconciled = stats.reconciled, failed = stats.failed, "controller stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crust_core::{ObjectKey, OrderSpec, PizzaOrder};
    use crust_fulfill::sim::SimProvider;
    use crust_store::MemStore;

    #[test]
    fn timers_rearm_instead_of_duplicating() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let mut t = Timers::new();
            let k = ObjectKey::new("ns", "a");
            t.schedule(k.clone(), Duration::from_secs(60));
            t.schedule(k.clone(), Duration::from_secs(1));
            assert_eq!(t.queue.len(), 1);
            t.cancel(&k);
            assert!(t.is_empty());
            assert_eq!(t.queue.len(), 0);
        });
    }

    #[tokio::test]
    async fn aborted_task_releases_its_key() {
        let mut set: JoinSet<()> = JoinSet::new();
        let mut in_flight = InFlight::default();
        let k = ObjectKey::new("ns", "a");
        let handle = set.spawn(std::future::pending());
        in_flight.start(handle.id(), k.clone());
        assert!(in_flight.contains(&k));
        handle.abort();
        let err = set.join_next_with_id().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(in_flight.finish(err.id()), Some(k.clone()));
        assert!(!in_flight.contains(&k));
        assert_eq!(in_flight.finish(err.id()), None);
    }

    #[tokio::test]
    async fn exits_when_feed_closes_after_draining() {
        let store = Arc::new(MemStore::new());
        store.apply(PizzaOrder::new(ObjectKey::new("ns", "idle"), OrderSpec::default())).await;
        let rec = Arc::new(Reconciler::new(store.clone(), store.clone(), Arc::new(SimProvider::default()), ReconcileConfig::default()));
        let (tx, rx) = mpsc::channel(8);
        for _ in 0..3 {
            tx.send(ObjectKey::new("ns", "idle")).await.unwrap();
        }
        drop(tx);
        let stats = tokio::time::timeout(
            Duration::from_secs(5),
            Controller::new(rec, &ReconcileConfig::default()).run(rx, CancellationToken::new()),
        )
        .await
        .expect("controller did not stop");
        assert!(stats.reconciled >= 1 && stats.reconciled <= 3);
        assert_eq!(stats.failed, 0);
    }
}
