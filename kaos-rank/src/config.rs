//! Engine configuration.

use crate::error::{RankError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration, loadable from JSON.
///
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    /// Wait after `end_time` before finalizing, so late score events can land.
    pub grace_period_secs: u64,
    /// Keep finalized items this long after `end_time` before expiring them.
    pub retention_secs: u64,
    /// Finalizer poll interval.
    pub poll_interval_secs: u64,
    /// How long a finalization claim holds before another poller may take it over.
    pub finalize_lease_secs: u64,
    /// Periodic snapshot interval.
    pub snapshot_interval_secs: u64,
    /// Rows per durable write.
    pub snapshot_batch_size: usize,
    /// Deliveries per award message before it is given up.
    pub award_max_attempts: u32,
    /// Backoff for snapshot and restore storage calls.
    pub retry: RetryPolicy,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 15 * 60,
            retention_secs: 7 * 24 * 60 * 60,
            poll_interval_secs: 60,
            finalize_lease_secs: 5 * 60,
            snapshot_interval_secs: 30,
            snapshot_batch_size: 1000,
            award_max_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl RankConfig {
    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.poll_interval_secs == 0, "poll_interval_secs must be > 0"),
            (self.finalize_lease_secs == 0, "finalize_lease_secs must be > 0"),
            (self.snapshot_interval_secs == 0, "snapshot_interval_secs must be > 0"),
            (self.snapshot_batch_size == 0, "snapshot_batch_size must be > 0"),
            (self.award_max_attempts == 0, "award_max_attempts must be > 0"),
            (self.retry.max_attempts == 0, "retry.max_attempts must be > 0"),
            (self.retry.backoff_multiplier < 1.0, "retry.backoff_multiplier must be >= 1.0"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(RankError::Config((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn finalize_lease(&self) -> Duration {
        Duration::from_secs(self.finalize_lease_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn with_grace_period(mut self, secs: u64) -> Self {
        self.grace_period_secs = secs;
        self
    }

    pub fn with_retention(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_finalize_lease(mut self, secs: u64) -> Self {
        self.finalize_lease_secs = secs;
        self
    }

    pub fn with_snapshot_interval(mut self, secs: u64) -> Self {
        self.snapshot_interval_secs = secs;
        self
    }

    pub fn with_snapshot_batch_size(mut self, size: usize) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    pub fn with_award_max_attempts(mut self, attempts: u32) -> Self {
        self.award_max_attempts = attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RankConfig::default();
        assert_eq!(config.grace_period(), Duration::from_secs(900));
        assert_eq!(config.retention(), Duration::from_secs(604_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: RankConfig =
            serde_json::from_str(r#"{"grace_period_secs": 60, "retry": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.grace_period_secs, 60);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert_eq!(config.snapshot_batch_size, 1000);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = RankConfig::default().with_snapshot_batch_size(0);
        assert!(matches!(config.validate(), Err(RankError::Config(_))));
        let config = RankConfig::default().with_poll_interval(0);
        assert!(config.validate().is_err());
        let config = RankConfig::default().with_finalize_lease(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("kaos-rank-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"retention_secs": 3600}"#).unwrap();
        let config = RankConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.retention(), Duration::from_secs(3600));
        assert!(RankConfig::from_file(&path).is_err());
    }
}
