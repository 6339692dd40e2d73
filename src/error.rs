use std::fmt;

use http::StatusCode;
use thiserror::Error;

use crate::deadline::Deadline;
use crate::execute::AttemptHistory;
use crate::response::{Response, ResponseBody};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Network-level failure codes reported by a transport.
///
/// Every code except [`TransportErrorCode::Other`] describes a transient
/// condition that is worth another attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum TransportErrorCode {
    TimedOut,
    ConnectionReset,
    AddrInUse,
    ConnectionRefused,
    BrokenPipe,
    NameNotFound,
    NetworkUnreachable,
    DnsTemporaryFailure,
    Other,
}

impl TransportErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::ConnectionReset => "connection_reset",
            Self::AddrInUse => "addr_in_use",
            Self::ConnectionRefused => "connection_refused",
            Self::BrokenPipe => "broken_pipe",
            Self::NameNotFound => "name_not_found",
            Self::NetworkUnreachable => "network_unreachable",
            Self::DnsTemporaryFailure => "dns_temporary_failure",
            Self::Other => "other",
        }
    }

    pub const fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }

    pub fn from_io_error(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => Self::ConnectionReset,
            ErrorKind::AddrInUse => Self::AddrInUse,
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::BrokenPipe => Self::BrokenPipe,
            ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            _ => Self::from_resolver_message(&error.to_string()),
        }
    }

    // Resolver failures surface as uncategorized io errors; only the text tells them apart.
    fn from_resolver_message(message: &str) -> Self {
        let text = message.to_ascii_lowercase();
        if text.contains("temporary failure in name resolution") || text.contains("try again") {
            return Self::DnsTemporaryFailure;
        }
        if text.contains("name or service not known")
            || text.contains("nodename nor servname")
            || text.contains("no such host")
            || text.contains("failed to lookup address")
        {
            return Self::NameNotFound;
        }
        Self::Other
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Transport,
    Timeout,
    HttpStatus,
    UnparseableBody,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::UnparseableBody => "unparseable_body",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The failure of a single attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{message} ({code})")]
    Transport {
        code: TransportErrorCode,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("Timeout \"{deadline}\" triggered after {threshold_ms}ms")]
    Timeout { deadline: Deadline, threshold_ms: u64 },
    #[error("Non-2xx status code")]
    HttpStatus { response: Box<Response> },
    #[error("Failed to parse response body")]
    UnparseableBody {
        response: Box<Response>,
        #[source]
        source: serde_json::Error,
    },
}

impl AttemptError {
    pub fn transport(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        code: TransportErrorCode,
        source: impl Into<BoxError>,
    ) -> Self {
        let source = source.into();
        Self::Transport {
            code,
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn transport_caused_by(
        code: TransportErrorCode,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn from_io(error: std::io::Error) -> Self {
        Self::transport_with_source(TransportErrorCode::from_io_error(&error), error)
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::UnparseableBody { .. } => ErrorCode::UnparseableBody,
        }
    }

    /// Network-level code of the failure. Timeouts report [`TransportErrorCode::TimedOut`].
    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            Self::Timeout { .. } => Some(TransportErrorCode::TimedOut),
            Self::HttpStatus { .. } | Self::UnparseableBody { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response().map(Response::status)
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::HttpStatus { response } | Self::UnparseableBody { response, .. } => {
                Some(response)
            }
            Self::Transport { .. } | Self::Timeout { .. } => None,
        }
    }

    /// Body of the triggering response; raw text when the body failed to parse.
    pub fn body(&self) -> Option<&ResponseBody> {
        self.response().map(Response::body)
    }

    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            Self::Timeout { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error surfaced by [`crate::execute`].
///
/// On the retrying path it carries the frozen history of the attempts that
/// failed before this one.
#[derive(Debug)]
pub struct Error {
    inner: AttemptError,
    history: Option<AttemptHistory>,
}

impl Error {
    pub(crate) fn with_history(inner: AttemptError, history: AttemptHistory) -> Self {
        Self {
            inner,
            history: Some(history),
        }
    }

    pub fn attempt_error(&self) -> &AttemptError {
        &self.inner
    }

    pub fn into_attempt_error(self) -> AttemptError {
        self.inner
    }

    pub fn history(&self) -> Option<&AttemptHistory> {
        self.history.as_ref()
    }

    pub fn failed_attempts(&self) -> Option<&[AttemptError]> {
        self.history.as_ref().map(AttemptHistory::failed_attempts)
    }

    pub fn attempt_count(&self) -> Option<usize> {
        self.history.as_ref().map(AttemptHistory::attempt_count)
    }

    pub const fn code(&self) -> ErrorCode {
        self.inner.code()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.inner.status()
    }

    pub fn transport_code(&self) -> Option<TransportErrorCode> {
        self.inner.transport_code()
    }

    pub fn response(&self) -> Option<&Response> {
        self.inner.response()
    }
}

impl From<AttemptError> for Error {
    fn from(inner: AttemptError) -> Self {
        Self {
            inner,
            history: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, formatter)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.inner)
    }
}
