use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_VALIDATION_INTERVAL: Duration = Duration::from_secs(60);

/// Retry, timeout and retention settings shared by the queue and update manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Executor calls per operation before it is marked failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub execution_timeout: Duration,
    /// How long confirmed, failed and merged records are kept for audit.
    pub retention: Duration,
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            retention: DEFAULT_RETENTION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the next attempt, given how many attempts already ran.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What to do with an overlay entry that no live operation backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrphanPolicy {
    /// Resubmit the local value through the normal submit path.
    TrustLocal,
    /// Drop the overlay entry and adopt the authoritative value.
    #[default]
    TrustRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub orphan_policy: OrphanPolicy,
    pub interval: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            orphan_policy: OrphanPolicy::default(),
            interval: DEFAULT_VALIDATION_INTERVAL,
        }
    }
}

impl ValidatorConfig {
    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = PipelineConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(750));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(750));
        assert_eq!(config.backoff(40), Duration::from_millis(750));
    }

    #[test]
    fn zero_max_attempts_still_runs_once() {
        assert_eq!(PipelineConfig::default().with_max_attempts(0).max_attempts(), 1);
    }
}
