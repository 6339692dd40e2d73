use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffDecision, BackoffPolicy, ExponentialBackoff};
use crate::classify::{RetryClassifier, StandardRetryClassifier};
use crate::deadline::Deadlines;
use crate::error::AttemptError;
use crate::observe::Observer;

static STANDARD_CLASSIFIER: StandardRetryClassifier = StandardRetryClassifier;

/// Options of one [`crate::execute`] call.
///
/// The default runs a single unobserved attempt: no timings, no deadlines,
/// no retry.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    measure_timings: bool,
    deadlines: Deadlines,
    retry_backoff: Option<Arc<dyn BackoffPolicy>>,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
    observer: Option<Arc<dyn Observer>>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure_timings(mut self, measure_timings: bool) -> Self {
        self.measure_timings = measure_timings;
        self
    }

    pub fn timeout_request(mut self, timeout: Duration) -> Self {
        self.deadlines.request = Some(timeout);
        self
    }

    pub fn timeout_response(mut self, timeout: Duration) -> Self {
        self.deadlines.response = Some(timeout);
        self
    }

    pub fn timeout_idle_socket(mut self, timeout: Duration) -> Self {
        self.deadlines.idle_socket = Some(timeout);
        self
    }

    pub fn timeout_total(mut self, timeout: Duration) -> Self {
        self.deadlines.total = Some(timeout);
        self
    }

    pub fn deadlines(mut self, deadlines: Deadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    /// Enables retrying. Without a backoff policy every call is a single
    /// attempt.
    pub fn retry_backoff<P>(self, policy: P) -> Self
    where
        P: BackoffPolicy + 'static,
    {
        self.retry_backoff_arc(Arc::new(policy))
    }

    pub fn retry_backoff_arc(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.retry_backoff = Some(policy);
        self
    }

    pub fn retry_backoff_fn<F>(self, policy: F) -> Self
    where
        F: Fn(i64, &AttemptError) -> BackoffDecision + Send + Sync + 'static,
    {
        self.retry_backoff_arc(Arc::new(policy))
    }

    pub fn retry_classifier<C>(mut self, classifier: C) -> Self
    where
        C: RetryClassifier + 'static,
    {
        self.retry_classifier = Some(Arc::new(classifier));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn measures_timings(&self) -> bool {
        self.measure_timings
    }

    pub fn configured_deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    /// Attempts are only observed when timings or a deadline were asked for.
    pub fn wants_observation(&self) -> bool {
        self.measure_timings || self.deadlines.any()
    }

    pub fn backoff(&self) -> Option<&dyn BackoffPolicy> {
        self.retry_backoff.as_deref()
    }

    pub fn classifier(&self) -> &dyn RetryClassifier {
        match &self.retry_classifier {
            Some(classifier) => classifier.as_ref(),
            None => &STANDARD_CLASSIFIER,
        }
    }

    pub fn execution_observer(&self) -> Option<&dyn Observer> {
        self.observer.as_deref()
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ExecuteOptions")
            .field("measure_timings", &self.measure_timings)
            .field("deadlines", &self.deadlines)
            .field("retry_backoff", &self.retry_backoff.is_some())
            .field("retry_classifier", &self.retry_classifier.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Serializable form of [`ExecuteOptions`]. Durations are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteConfig {
    pub measure_timings: bool,
    pub timeout_request: Option<u64>,
    pub timeout_response: Option<u64>,
    pub timeout_idle_socket: Option<u64>,
    pub timeout_total: Option<u64>,
    pub retry_backoff: Option<BackoffConfig>,
}

impl ExecuteConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            request: self.timeout_request.map(Duration::from_millis),
            response: self.timeout_response.map(Duration::from_millis),
            idle_socket: self.timeout_idle_socket.map(Duration::from_millis),
            total: self.timeout_total.map(Duration::from_millis),
        }
    }
}

impl From<ExecuteConfig> for ExecuteOptions {
    fn from(config: ExecuteConfig) -> Self {
        let options = ExecuteOptions::new()
            .measure_timings(config.measure_timings)
            .deadlines(config.deadlines());
        match config.retry_backoff {
            Some(backoff) => options.retry_backoff(ExponentialBackoff::from(backoff)),
            None => options,
        }
    }
}

/// Settings of the default exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BackoffConfig {
    pub limit: u32,
    pub min_delay: u64,
    pub max_delay: u64,
    pub jitter: bool,
    pub fast_first: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            limit: 3,
            min_delay: 100,
            max_delay: 1000,
            jitter: true,
            fast_first: false,
        }
    }
}

impl From<BackoffConfig> for ExponentialBackoff {
    fn from(config: BackoffConfig) -> Self {
        ExponentialBackoff::new()
            .limit(config.limit)
            .min_delay(Duration::from_millis(config.min_delay))
            .max_delay(Duration::from_millis(config.max_delay))
            .jitter(config.jitter)
            .fast_first(config.fast_first)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffConfig, ExecuteConfig, ExecuteOptions};
    use crate::backoff::{BackoffDecision, ExponentialBackoff};
    use crate::deadline::Deadline;
    use crate::error::{AttemptError, TransportErrorCode};

    #[test]
    fn parses_camel_case_keys() {
        let config = ExecuteConfig::from_json_str(
            r#"{
                "measureTimings": true,
                "timeoutResponse": 5,
                "timeoutTotal": 1000,
                "retryBackoff": { "limit": 6, "minDelay": 50, "fastFirst": true }
            }"#,
        )
        .expect("config should parse");

        assert!(config.measure_timings);
        assert_eq!(config.timeout_response, Some(5));
        assert_eq!(config.timeout_request, None);
        let backoff = config.retry_backoff.clone().expect("backoff should be set");
        assert_eq!(
            backoff,
            BackoffConfig {
                limit: 6,
                min_delay: 50,
                max_delay: 1000,
                jitter: true,
                fast_first: true,
            }
        );

        let options = ExecuteOptions::from(config);
        assert!(options.measures_timings());
        assert!(options.backoff().is_some());
        assert_eq!(
            options.configured_deadlines().get(Deadline::Response),
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = ExecuteConfig::from_json_str(r#"{ "timeoutConnect": 5 }"#)
            .expect_err("unknown key should be rejected");
        assert!(error.to_string().contains("timeoutConnect"));

        ExecuteConfig::from_json_str(r#"{ "retryBackoff": { "retries": 2 } }"#)
            .expect_err("unknown backoff key should be rejected");
    }

    #[test]
    fn zero_timeout_is_not_configured() {
        let options = ExecuteOptions::from(
            ExecuteConfig::from_json_str(r#"{ "timeoutTotal": 0 }"#).expect("config should parse"),
        );
        assert!(!options.wants_observation());
        assert_eq!(options.configured_deadlines().get(Deadline::Total), None);
    }

    #[test]
    fn defaults_run_a_single_unobserved_attempt() {
        let options = ExecuteOptions::default();
        assert!(!options.wants_observation());
        assert!(options.backoff().is_none());
        assert!(options.execution_observer().is_none());

        let error = AttemptError::transport(TransportErrorCode::ConnectionReset, "socket hang up");
        assert!(options.classifier().should_retry(&error));
    }

    #[test]
    fn backoff_config_converts_to_exponential_backoff() {
        let backoff = ExponentialBackoff::from(BackoffConfig {
            limit: 1,
            min_delay: 10,
            max_delay: 15,
            jitter: false,
            fast_first: false,
        });
        assert_eq!(
            backoff.delay_for(0),
            BackoffDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            backoff.delay_for(1),
            BackoffDecision::RetryAfter(Duration::from_millis(15))
        );
        assert_eq!(backoff.delay_for(2), BackoffDecision::Stop);
    }
}
