use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::AttemptError;
use crate::observe::{AttemptContext, Observer};
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub attempts_started: u64,
    pub attempts_succeeded: u64,
    pub attempts_failed: u64,
    pub retries_scheduled: u64,
    pub retry_delay_total_ms: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub http_status_errors: u64,
    pub unparseable_bodies: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// [`Observer`] that counts attempts, failures and retries.
///
/// Share it through an `Arc` so the counters stay readable after execution.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    attempts_started: AtomicU64,
    attempts_succeeded: AtomicU64,
    attempts_failed: AtomicU64,
    retries_scheduled: AtomicU64,
    retry_delay_total_ms: AtomicU64,
    timeouts: AtomicU64,
    transport_errors: AtomicU64,
    http_status_errors: AtomicU64,
    unparseable_bodies: AtomicU64,
    latency_samples: AtomicU64,
    latency_total_ms: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency_samples = self.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            attempts_started: self.attempts_started.load(Ordering::Relaxed),
            attempts_succeeded: self.attempts_succeeded.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            retry_delay_total_ms: self.retry_delay_total_ms.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            http_status_errors: self.http_status_errors.load(Ordering::Relaxed),
            unparseable_bodies: self.unparseable_bodies.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&self.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms
            .fetch_add(saturating_millis(latency), Ordering::Relaxed);
    }

    fn add_status_count(&self, status: u16) {
        let mut status_counts = lock_unpoisoned(&self.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let mut error_counts = lock_unpoisoned(&self.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Observer for MetricsObserver {
    fn on_attempt_start(&self, _context: &AttemptContext) {
        self.attempts_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_attempt_succeeded(
        &self,
        _context: &AttemptContext,
        response: &Response,
        elapsed: Duration,
    ) {
        self.attempts_succeeded.fetch_add(1, Ordering::Relaxed);
        self.add_status_count(response.status().as_u16());
        self.record_latency(elapsed);
    }

    fn on_attempt_failed(
        &self,
        _context: &AttemptContext,
        error: &AttemptError,
        elapsed: Duration,
    ) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(elapsed);
        match error {
            AttemptError::Transport { code, .. } => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("transport:{code}"));
            }
            AttemptError::Timeout { deadline, .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("timeout:{deadline}"));
            }
            AttemptError::HttpStatus { response } => {
                let status = response.status().as_u16();
                self.http_status_errors.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(status);
                self.add_error_count(format!("http_status:{status}"));
            }
            AttemptError::UnparseableBody { response, .. } => {
                self.unparseable_bodies.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
                self.add_error_count("unparseable_body".to_owned());
            }
        }
    }

    fn on_retry_scheduled(
        &self,
        _context: &AttemptContext,
        _error: &AttemptError,
        delay: Duration,
    ) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        self.retry_delay_total_ms
            .fetch_add(saturating_millis(delay), Ordering::Relaxed);
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
