//! `reqwatch` runs HTTP attempts under per-phase deadlines, measures their
//! lifecycle, and retries failures under a pluggable backoff policy.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use reqwatch::prelude::{
//!     ExecuteOptions, ExponentialBackoff, HttpRequestFactory, MetricsObserver, RequestSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Arc::new(MetricsObserver::new());
//!     let options = ExecuteOptions::new()
//!         .measure_timings(true)
//!         .timeout_response(Duration::from_millis(500))
//!         .timeout_total(Duration::from_secs(3))
//!         .retry_backoff(ExponentialBackoff::new().limit(3))
//!         .observer(metrics.clone());
//!
//!     let request = RequestSpec::get("http://127.0.0.1:8080/v1/items".parse()?);
//!     let response = reqwatch::execute(HttpRequestFactory::new(request), &options).await?;
//!
//!     println!(
//!         "status={} attempts={:?} total_ms={:?}",
//!         response.status(),
//!         response.attempt_count(),
//!         response.timings().map(|timings| timings.total_ms()),
//!     );
//!     println!("{:?}", metrics.snapshot());
//!     Ok(())
//! }
//! ```
//!
//! # Custom transports
//!
//! Anything implementing [`Attempt`] can be executed: it yields
//! [`LifecycleEvent`]s and `execute` turns them into timings, deadline
//! transitions and a [`Response`]. Any `FnMut() -> impl Attempt` is an
//! [`AttemptFactory`].

mod backoff;
mod classify;
mod config;
mod deadline;
mod error;
mod execute;
mod lifecycle;
mod metrics;
mod observe;
mod response;
mod timing;
mod transport;
mod util;

pub use crate::backoff::{BackoffDecision, BackoffPolicy, ExponentialBackoff};
pub use crate::classify::{
    RetryClassifier, StandardRetryClassifier, is_retriable, is_retriable_status,
};
pub use crate::config::{BackoffConfig, ExecuteConfig, ExecuteOptions};
pub use crate::deadline::{Deadline, Deadlines, TimeoutSupervisor};
pub use crate::error::{AttemptError, Error, ErrorCode, TransportErrorCode};
pub use crate::execute::{AttemptHistory, execute};
pub use crate::lifecycle::{Attempt, AttemptFactory, LifecycleEvent, LifecycleObserver};
pub use crate::metrics::{MetricsObserver, MetricsSnapshot};
pub use crate::observe::{AttemptContext, Observer};
pub use crate::response::{Response, ResponseBody, build_response};
pub use crate::timing::{Phase, PhaseTimer, PhaseTimings, UnknownPhase};
pub use crate::transport::{HttpAttempt, HttpRequestFactory, RequestSpec};

pub type ReqwatchResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::execute::execute;
    pub use crate::{
        AttemptError, BackoffDecision, BackoffPolicy, Error, ExecuteConfig, ExecuteOptions,
        ExponentialBackoff, HttpRequestFactory, MetricsObserver, Observer, Phase, ReqwatchResult,
        RequestSpec, Response, ResponseBody,
    };
}
