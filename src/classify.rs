use http::StatusCode;

use crate::error::AttemptError;

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, error: &AttemptError) -> bool;
}

/// Retries 5xx, 408 and 429 responses and transient network failures.
///
/// A failure that carries a status code is judged by the status alone;
/// everything else is judged by its transport code.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardRetryClassifier;

impl RetryClassifier for StandardRetryClassifier {
    fn should_retry(&self, error: &AttemptError) -> bool {
        is_retriable(error)
    }
}

pub fn is_retriable(error: &AttemptError) -> bool {
    if let Some(status) = error.status() {
        return is_retriable_status(status);
    }
    error
        .transport_code()
        .is_some_and(|code| code.is_transient())
}

pub fn is_retriable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status.as_u16() >= 600
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}
