use std::time::Duration;

use rand::Rng;

use crate::error::AttemptError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffDecision {
    RetryAfter(Duration),
    Stop,
}

/// Decides how long to wait before the next attempt, or that retrying stops.
///
/// Knows nothing about HTTP; the orchestrator only consults it for failures
/// already classified as retriable.
pub trait BackoffPolicy: Send + Sync {
    fn decide(&self, retry_index: i64, error: &AttemptError) -> BackoffDecision;
}

impl<F> BackoffPolicy for F
where
    F: Fn(i64, &AttemptError) -> BackoffDecision + Send + Sync,
{
    fn decide(&self, retry_index: i64, error: &AttemptError) -> BackoffDecision {
        self(retry_index, error)
    }
}

/// Exponential backoff with optional jitter:
/// `min(max_delay, 2^retry_index * min_delay * jitter_factor)`, where the
/// jitter factor is drawn from `[1, 2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    limit: u32,
    min_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    fast_first: bool,
}

impl ExponentialBackoff {
    pub const fn new() -> Self {
        Self {
            limit: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: true,
            fast_first: false,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retry index 0 waits a single millisecond.
    pub fn fast_first(mut self, fast_first: bool) -> Self {
        self.fast_first = fast_first;
        self
    }

    pub fn configured_limit(&self) -> u32 {
        self.limit
    }

    pub fn delay_for(&self, retry_index: i64) -> BackoffDecision {
        if retry_index > i64::from(self.limit) {
            return BackoffDecision::Stop;
        }
        if retry_index == 0 && self.fast_first {
            return BackoffDecision::RetryAfter(Duration::from_millis(1));
        }

        let jitter_factor = if self.jitter {
            rand::rng().random_range(1.0..2.0)
        } else {
            1.0
        };
        let exponent = retry_index.clamp(-63, 63) as i32;
        let delay_ms = 2_f64.powi(exponent) * millis(self.min_delay) * jitter_factor;
        let capped_ms = delay_ms.min(millis(self.max_delay)).max(0.0);
        BackoffDecision::RetryAfter(Duration::from_micros((capped_ms * 1000.0).round() as u64))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn decide(&self, retry_index: i64, _error: &AttemptError) -> BackoffDecision {
        self.delay_for(retry_index)
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}
