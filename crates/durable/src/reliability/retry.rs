//! Retry policy for failed workflows

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// When a failed workflow may be run again
///
/// Attempts count whole executor runs of one workflow (the first run is attempt 1).
/// The delay before the next run grows exponentially with jitter to avoid
/// hammering a provisioner that is already struggling.
///
/// # Example
///
/// ```
/// use graduation_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(30))
///     .with_max_interval(Duration::from_secs(600));
///
/// // After the first failed run, wait ~30 seconds
/// // After the second, ~60 seconds
/// // After the third, ~120 seconds
/// assert!(policy.allows_retry(1, true));
/// assert!(!policy.allows_retry(5, true));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of runs (including the first)
    pub max_attempts: u32,

    /// Delay after the first failed run
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between runs
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with defaults suited to slow external provisioners
    ///
    /// - 5 max attempts
    /// - 30 second initial interval
    /// - 10 minute max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(600),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// A policy that never schedules another run
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed interval between runs (no backoff, no jitter)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next run, after `attempts` runs have failed (1-based)
    pub fn delay_after(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(attempts as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether a workflow that failed on its `attempts`-th run may run again
    pub fn allows_retry(&self, attempts: u32, retryable: bool) -> bool {
        retryable && attempts < self.max_attempts
    }

    /// Earliest time of the next run, or `None` when no retry is allowed
    pub fn next_retry_at(
        &self,
        attempts: u32,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !self.allows_retry(attempts, retryable) {
            return None;
        }
        let delay = chrono::Duration::from_std(self.delay_after(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        Some(now + delay)
    }
}
