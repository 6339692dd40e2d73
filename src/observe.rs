use std::time::Duration;

use crate::error::AttemptError;
use crate::response::Response;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    attempt: usize,
    retrying: bool,
}

impl AttemptContext {
    pub(crate) fn new(attempt: usize, retrying: bool) -> Self {
        Self { attempt, retrying }
    }

    /// One-based attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Whether a backoff policy is configured for this execution.
    pub fn retrying(&self) -> bool {
        self.retrying
    }
}

pub trait Observer: Send + Sync {
    fn on_attempt_start(&self, _context: &AttemptContext) {}

    fn on_attempt_succeeded(
        &self,
        _context: &AttemptContext,
        _response: &Response,
        _elapsed: Duration,
    ) {
    }

    fn on_attempt_failed(
        &self,
        _context: &AttemptContext,
        _error: &AttemptError,
        _elapsed: Duration,
    ) {
    }

    fn on_retry_scheduled(
        &self,
        _context: &AttemptContext,
        _error: &AttemptError,
        _delay: Duration,
    ) {
    }
}
