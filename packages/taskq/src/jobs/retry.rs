//! Retry scheduling: exponential backoff bounded by a retry ceiling.

use std::time::Duration;

use super::store::Outcome;
use super::task::{Task, TaskError};

/// Longest delay any retry is scheduled with, whatever the policy says.
/// Keeps `NOW() + delay` inside the range of a Postgres `timestamptz`.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Per-task retry policy.
///
/// `backoff(n) = min(base_delay * multiplier^(n - 1), max_delay)` where `n` is
/// the attempt that just failed (1-based). Without a `max_delay` the delay
/// still stops growing at [`MAX_RETRY_DELAY`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: i32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(3600)), // 1 hour
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: i32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries: max_retries.max(0),
            base_delay,
            multiplier,
            max_delay: None,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).max(0);
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };

        let secs = self.base_delay.as_secs_f64() * multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        self.max_delay
            .map_or(delay, |cap| delay.min(cap))
            .min(MAX_RETRY_DELAY)
    }

    /// Decide what a failed attempt of `task` turns into.
    ///
    /// The row's own `max_retries` is the ceiling; the policy only shapes the
    /// delay.
    pub fn on_failure(&self, task: &Task, error: TaskError) -> Outcome {
        if error.kind.should_retry() && task.can_retry() {
            Outcome::Retry {
                delay: self.backoff(task.attempt_count),
            }
        } else {
            Outcome::Failure(error)
        }
    }
}
