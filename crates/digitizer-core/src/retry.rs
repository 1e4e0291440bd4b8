//! Retry, backoff and retention policy for a queue.

use std::time::Duration;

use crate::defaults;

/// Exponential backoff: the retry after attempt `n` waits `base × 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay before the job becomes eligible again after `attempts_made` attempts.
    pub fn delay_for(&self, attempts_made: i32) -> Duration {
        backoff_delay(self.base_delay.as_millis() as i64, attempts_made)
    }
}

/// Backoff delay from a stored base in milliseconds.
///
/// The exponent is capped so the multiplication cannot overflow.
pub fn backoff_delay(base_ms: i64, attempts_made: i32) -> Duration {
    let exponent = (attempts_made.max(1) - 1).min(20) as u32;
    let ms = (base_ms.max(0) as u64).saturating_mul(1u64 << exponent);
    Duration::from_millis(ms)
}

/// How long finished jobs are kept before pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max_age: chrono::Duration,
    pub completed_keep: i64,
    pub failed_max_age: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age: chrono::Duration::seconds(defaults::COMPLETED_JOB_RETENTION_SECS),
            completed_keep: defaults::COMPLETED_JOB_KEEP_COUNT,
            failed_max_age: chrono::Duration::seconds(defaults::FAILED_JOB_RETENTION_SECS),
        }
    }
}

/// Per-queue settings fixed at construction time.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub lease_duration: Duration,
    pub retention: RetentionPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: defaults::QUEUE_NAME.to_string(),
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            lease_duration: Duration::from_secs(defaults::JOB_LEASE_SECS),
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueOptions {
    /// Create options from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_NAME` | `digitization` | Queue name |
    /// | `JOB_MAX_ATTEMPTS` | `3` | Attempts before dead-lettering |
    /// | `JOB_BACKOFF_MS` | `2000` | Base backoff delay |
    /// | `JOB_LEASE_SECS` | `30` | Lease granted per claim/progress update |
    pub fn from_env() -> Self {
        let name =
            std::env::var("QUEUE_NAME").unwrap_or_else(|_| defaults::QUEUE_NAME.to_string());

        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
            .max(1);

        let backoff_ms = std::env::var("JOB_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_BASE_MS);

        let lease_secs = std::env::var("JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_LEASE_SECS)
            .max(1);

        Self {
            name,
            max_attempts,
            backoff: BackoffPolicy::exponential(Duration::from_millis(backoff_ms)),
            lease_duration: Duration::from_secs(lease_secs),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration) -> Self {
        self.backoff = BackoffPolicy::exponential(base_delay);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}
