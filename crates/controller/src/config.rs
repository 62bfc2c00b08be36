use std::str::FromStr;
use std::time::Duration;

use keel_core::ObjectKey;
use keel_queue::{BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime knobs for the controller. Defaults, then `KEEL_*` env overrides,
/// then CLI flags (applied by the binary).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Reporter name on audit events and work queue label.
    pub controller_name: String,
    pub workers: usize,
    /// Watch a single namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Periodic re-delivery of every cached object; 0 disables.
    pub resync_secs: u64,
    pub cache_sync_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    /// Overall retry budget shared by all keys.
    pub qps: f64,
    pub burst: u32,
    /// Capacity of the watcher -> cache channel.
    pub ingest_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: "keel-sample-controller".into(),
            workers: 2,
            namespace: None,
            resync_secs: 30,
            cache_sync_timeout_secs: 120,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            qps: 10.0,
            burst: 100,
            ingest_cap: 1024,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },
    #[error("backoff base ({base_ms}ms) exceeds backoff max ({max_secs}s)")]
    BackoffRange { base_ms: u64, max_secs: u64 },
    #[error("controller name must not be empty")]
    EmptyName,
}

/// Longest per-key retry delay accepted from configuration (one day).
pub const MAX_BACKOFF_SECS: u64 = 86_400;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `KEEL_*` environment variables.
    pub fn from_env() -> Self { Self::default().with_env_overrides() }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("KEEL_CONTROLLER_NAME") {
            self.controller_name = name;
        }
        if let Some(v) = env_parse("KEEL_WORKERS") { self.workers = v; }
        if let Ok(ns) = std::env::var("KEEL_NAMESPACE") {
            self.namespace = if ns.is_empty() { None } else { Some(ns) };
        }
        if let Some(v) = env_parse("KEEL_RESYNC_SECS") { self.resync_secs = v; }
        if let Some(v) = env_parse("KEEL_CACHE_SYNC_TIMEOUT_SECS") { self.cache_sync_timeout_secs = v; }
        if let Some(v) = env_parse("KEEL_BACKOFF_BASE_MS") { self.backoff_base_ms = v; }
        if let Some(v) = env_parse("KEEL_BACKOFF_MAX_SECS") { self.backoff_max_secs = v; }
        if let Some(v) = env_parse("KEEL_QPS") { self.qps = v; }
        if let Some(v) = env_parse("KEEL_BURST") { self.burst = v; }
        if let Some(v) = env_parse("KEEL_INGEST_CAP") { self.ingest_cap = v; }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if self.cache_sync_timeout_secs == 0 {
            return Err(ConfigError::Zero("cache_sync_timeout_secs"));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Zero("backoff_base_ms"));
        }
        if !(self.qps > 0.0) {
            return Err(ConfigError::Zero("qps"));
        }
        if self.burst == 0 {
            return Err(ConfigError::Zero("burst"));
        }
        if self.backoff_max_secs > MAX_BACKOFF_SECS {
            return Err(ConfigError::TooLarge { field: "backoff_max_secs", max: MAX_BACKOFF_SECS });
        }
        if self.backoff_base() > self.backoff_max() {
            return Err(ConfigError::BackoffRange { base_ms: self.backoff_base_ms, max_secs: self.backoff_max_secs });
        }
        Ok(())
    }

    pub fn resync(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn cache_sync_timeout(&self) -> Duration { Duration::from_secs(self.cache_sync_timeout_secs) }

    pub fn backoff_base(&self) -> Duration { Duration::from_millis(self.backoff_base_ms) }

    pub fn backoff_max(&self) -> Duration { Duration::from_secs(self.backoff_max_secs) }

    /// Per-key exponential backoff bounded by the shared token bucket.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<ObjectKey> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(self.backoff_base(), self.backoff_max())),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ControllerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.resync(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.backoff_base(), Duration::from_millis(5));
    }

    #[test]
    fn rejects_zero_workers_and_inverted_backoff() {
        let cfg = ControllerConfig { workers: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("workers")));

        let cfg = ControllerConfig { backoff_base_ms: 5_000, backoff_max_secs: 1, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BackoffRange { .. })));

        let cfg = ControllerConfig { qps: 0.0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("qps")));
    }

    #[test]
    fn rejects_unbounded_backoff_ceiling() {
        let cfg = ControllerConfig { backoff_max_secs: u64::MAX, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::TooLarge { field: "backoff_max_secs", max: MAX_BACKOFF_SECS }));
        let cfg = ControllerConfig { backoff_max_secs: MAX_BACKOFF_SECS, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_resync_disables_it() {
        let cfg = ControllerConfig { resync_secs: 0, ..Default::default() };
        assert_eq!(cfg.resync(), None);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = ControllerConfig { namespace: Some("ns1".into()), workers: 4, ..Default::default() };
        let back: ControllerConfig = serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
