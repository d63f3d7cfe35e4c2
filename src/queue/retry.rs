//! Exponential retry backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Backoff applied between failed executions of a job.
///
/// The delay before the k-th retry is `base * 2^k`, i.e. 2s, 4s, 8s with the
/// default one-second base, optionally clamped to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the retry that follows the `attempts`-th failure.
    pub fn delay(&self, attempts: u32) -> Duration {
        // 2^31 seconds is already ~68 years; clamp the exponent to stay finite.
        let delay = self.base.saturating_mul(1u32 << attempts.min(31));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Absolute due time of the next retry.
    pub fn next_run_at(&self, failed_at: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        failed_at + delay
    }
}
