//! Runtime knobs for the reconciler and controller, with `CRUST_*` environment overrides.

use std::time::Duration;

use crust_core::Money;
use tracing::warn;

pub const DEFAULT_POLL_SECS: u64 = 120;
pub const DEFAULT_RETRY_SECS: u64 = 300;
pub const DEFAULT_TIP: Money = Money::from_cents(500);
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Delay between tracking polls of a placed order (also used after a successful placement).
    pub poll_interval: Duration,
    /// Delay before retrying after any failed step.
    pub retry_interval: Duration,
    /// Added to every payment.
    pub gratuity: Money,
    /// Upper bound for a single external call; None waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// Distinct keys reconciled in parallel.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            retry_interval: Duration::from_secs(DEFAULT_RETRY_SECS),
            gratuity: DEFAULT_TIP,
            call_timeout: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary variable source; unparsable values keep the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = get(key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = key, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        }
        let mut cfg = Self::default();
        if let Some(s) = parsed::<u64>(&get, "CRUST_POLL_SECS") {
            cfg.poll_interval = Duration::from_secs(s.max(1));
        }
        if let Some(s) = parsed::<u64>(&get, "CRUST_RETRY_SECS") {
            cfg.retry_interval = Duration::from_secs(s.max(1));
        }
        if let Some(tip) = parsed::<Money>(&get, "CRUST_TIP") {
            cfg.gratuity = tip;
        }
        cfg.call_timeout = parsed::<u64>(&get, "CRUST_CALL_TIMEOUT_SECS").filter(|s| *s > 0).map(Duration::from_secs);
        if let Some(n) = parsed::<usize>(&get, "CRUST_CONCURRENCY") {
            cfg.concurrency = n.max(1);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_match_fixed_intervals() {
        let c = ReconcileConfig::from_lookup(lookup(&[]));
        assert_eq!(c, ReconcileConfig::default());
        assert_eq!(c.poll_interval, Duration::from_secs(120));
        assert_eq!(c.retry_interval, Duration::from_secs(300));
        assert_eq!(c.gratuity.to_string(), "5.00");
        assert!(c.call_timeout.is_none());
    }

    #[test]
    fn env_overrides_and_bad_values() {
        let c = ReconcileConfig::from_lookup(lookup(&[
            ("CRUST_POLL_SECS", "30"),
            ("CRUST_RETRY_SECS", "nope"),
            ("CRUST_TIP", "2.50"),
            ("CRUST_CALL_TIMEOUT_SECS", "10"),
            ("CRUST_CONCURRENCY", "0"),
        ]));
        assert_eq!(c.poll_interval, Duration::from_secs(30));
        assert_eq!(c.retry_interval, Duration::from_secs(300));
        assert_eq!(c.gratuity, Money::from_cents(250));
        assert_eq!(c.call_timeout, Some(Duration::from_secs(10)));
        assert_eq!(c.concurrency, 1);
    }
}
