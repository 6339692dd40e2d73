use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::time::{Instant, sleep};
use tracing::{Instrument, debug, info_span, warn};

use crate::ReqwatchResult;
use crate::backoff::BackoffDecision;
use crate::config::ExecuteOptions;
use crate::deadline::Deadline;
use crate::error::{AttemptError, Error, TransportErrorCode};
use crate::lifecycle::{Attempt, AttemptFactory, LifecycleEvent, LifecycleObserver};
use crate::observe::AttemptContext;
use crate::response::{Response, build_response};

/// Failures that preceded the final outcome of a retrying execution.
///
/// Frozen once the execution ends; clones share the same list.
#[derive(Clone, Debug)]
pub struct AttemptHistory {
    failed_attempts: Arc<[AttemptError]>,
}

impl AttemptHistory {
    pub(crate) fn freeze(failed_attempts: Vec<AttemptError>) -> Self {
        Self {
            failed_attempts: failed_attempts.into(),
        }
    }

    /// Oldest first.
    pub fn failed_attempts(&self) -> &[AttemptError] {
        &self.failed_attempts
    }

    /// Failed attempts plus the final one.
    pub fn attempt_count(&self) -> usize {
        self.failed_attempts.len() + 1
    }
}

/// Accumulates the response carried by an attempt's events.
#[derive(Default)]
struct Exchange {
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

enum Progress {
    Pending,
    Complete {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Failed(AttemptError),
}

impl Exchange {
    fn accept(&mut self, event: LifecycleEvent) -> Progress {
        match event {
            LifecycleEvent::ResponseHeaders { status, headers } => {
                self.head = Some((status, headers));
            }
            LifecycleEvent::BodyChunk(chunk) => self.body.extend_from_slice(&chunk),
            LifecycleEvent::BodyEnded => {
                let Some((status, headers)) = self.head.take() else {
                    return Progress::Failed(AttemptError::transport(
                        TransportErrorCode::Other,
                        "response ended before headers were received",
                    ));
                };
                return Progress::Complete {
                    status,
                    headers,
                    body: std::mem::take(&mut self.body).freeze(),
                };
            }
            LifecycleEvent::ResponseError(error) | LifecycleEvent::Error(error) => {
                return Progress::Failed(error);
            }
            LifecycleEvent::SocketAcquired { .. }
            | LifecycleEvent::DnsResolved
            | LifecycleEvent::TcpConnected
            | LifecycleEvent::TlsHandshakeComplete
            | LifecycleEvent::UploadFinished
            | LifecycleEvent::IdleTimeout => {}
        }
        Progress::Pending
    }
}

fn hang_up() -> AttemptError {
    AttemptError::transport(TransportErrorCode::ConnectionReset, "socket hang up")
}

/// Runs one attempt to completion.
///
/// The attempt is only observed when timings or deadlines are requested.
pub(crate) async fn run_attempt<A: Attempt>(
    attempt: A,
    options: &ExecuteOptions,
) -> Result<Response, AttemptError> {
    if options.wants_observation() {
        let observer = LifecycleObserver::start(*options.configured_deadlines());
        run_supervised(attempt, observer, options.measures_timings()).await
    } else {
        run_unobserved(attempt).await
    }
}

async fn run_unobserved<A: Attempt>(mut attempt: A) -> Result<Response, AttemptError> {
    let mut exchange = Exchange::default();
    loop {
        let Some(event) = attempt.next_event().await else {
            return Err(hang_up());
        };
        match exchange.accept(event) {
            Progress::Pending => {}
            Progress::Complete {
                status,
                headers,
                body,
            } => return build_response(status, headers, body, None),
            Progress::Failed(error) => return Err(error),
        }
    }
}

// A fired deadline aborts the attempt.
async fn run_supervised<A: Attempt>(
    mut attempt: A,
    mut observer: LifecycleObserver,
    measure_timings: bool,
) -> Result<Response, AttemptError> {
    let mut exchange = Exchange::default();
    loop {
        let next = {
            let supervisor = observer.supervisor();
            tokio::select! {
                biased;
                deadline = supervisor.expired() => Err(deadline),
                event = attempt.next_event() => Ok(event),
            }
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return Err(hang_up()),
            Err(deadline) => return Err(abort_on_deadline(&mut attempt, observer, deadline)),
        };

        if let Some(deadline) = observer.on_event(&event, &mut attempt) {
            return Err(abort_on_deadline(&mut attempt, observer, deadline));
        }

        match exchange.accept(event) {
            Progress::Pending => {}
            Progress::Complete {
                status,
                headers,
                body,
            } => {
                let timings = observer.finish();
                return build_response(status, headers, body, measure_timings.then_some(timings));
            }
            Progress::Failed(error) => return Err(error),
        }
    }
}

fn abort_on_deadline<A: Attempt>(
    attempt: &mut A,
    observer: LifecycleObserver,
    deadline: Deadline,
) -> AttemptError {
    attempt.abort();
    let error = observer.supervisor().timeout_error(deadline);
    let elapsed_ms = observer.finish().total_ms();
    warn!(
        deadline = %deadline,
        elapsed_ms,
        "deadline fired, aborting attempt"
    );
    error
}

/// Runs attempts produced by `factory` until one succeeds or retrying ends.
///
/// Without a backoff policy this is exactly one attempt and its outcome is
/// returned untouched. With one, failures the classifier deems retriable are
/// handed to the policy with `retry_index = failures_so_far - 1`; the final
/// outcome carries the frozen history of the failures before it.
pub async fn execute<F>(mut factory: F, options: &ExecuteOptions) -> ReqwatchResult<Response>
where
    F: AttemptFactory,
{
    let Some(backoff) = options.backoff() else {
        let context = AttemptContext::new(1, false);
        return run_observed(&mut factory, options, &context)
            .await
            .map_err(Error::from);
    };
    let classifier = options.classifier();
    let mut failures: Vec<AttemptError> = Vec::new();

    loop {
        let context = AttemptContext::new(failures.len() + 1, true);
        let error = match run_observed(&mut factory, options, &context).await {
            Ok(response) => return Ok(response.with_history(AttemptHistory::freeze(failures))),
            Err(error) => error,
        };

        if !classifier.should_retry(&error) {
            debug!(
                attempt = context.attempt(),
                code = error.code().as_str(),
                "failure is not retriable"
            );
            return Err(Error::with_history(error, AttemptHistory::freeze(failures)));
        }

        let retry_index = failures.len() as i64 - 1;
        match backoff.decide(retry_index, &error) {
            BackoffDecision::Stop => {
                debug!(
                    attempt = context.attempt(),
                    retry_index, "backoff policy stopped retrying"
                );
                return Err(Error::with_history(error, AttemptHistory::freeze(failures)));
            }
            BackoffDecision::RetryAfter(delay) => {
                warn!(
                    attempt = context.attempt(),
                    retry_index,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying failed attempt"
                );
                if let Some(hooks) = options.execution_observer() {
                    hooks.on_retry_scheduled(&context, &error, delay);
                }
                failures.push(error);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
}

async fn run_observed<F: AttemptFactory>(
    factory: &mut F,
    options: &ExecuteOptions,
    context: &AttemptContext,
) -> Result<Response, AttemptError> {
    let hooks = options.execution_observer();
    if let Some(hooks) = hooks {
        hooks.on_attempt_start(context);
    }
    let span = info_span!(
        "reqwatch.attempt",
        attempt = context.attempt(),
        retrying = context.retrying()
    );
    let started = Instant::now();
    let attempt = factory.start_attempt();

    let result = async {
        debug!("attempt started");
        let result = run_attempt(attempt, options).await;
        match &result {
            Ok(response) => debug!(
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "attempt completed"
            ),
            Err(error) => debug!(
                code = error.code().as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %error,
                "attempt failed"
            ),
        }
        result
    }
    .instrument(span)
    .await;

    if let Some(hooks) = hooks {
        match &result {
            Ok(response) => hooks.on_attempt_succeeded(context, response, started.elapsed()),
            Err(error) => hooks.on_attempt_failed(context, error, started.elapsed()),
        }
    }
    result
}
