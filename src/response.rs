use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::AttemptError;
use crate::execute::AttemptHistory;
use crate::timing::PhaseTimings;

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Json(Value),
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    raw_body: Bytes,
    body: ResponseBody,
    timings: Option<PhaseTimings>,
    history: Option<AttemptHistory>,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Header names are lowercase.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw_body).into_owned()
    }

    /// Decodes the raw body into `T`, independent of the content type.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.raw_body)
    }

    /// Present only when timings were requested.
    pub fn timings(&self) -> Option<&PhaseTimings> {
        self.timings.as_ref()
    }

    /// Present only on the retrying path.
    pub fn history(&self) -> Option<&AttemptHistory> {
        self.history.as_ref()
    }

    pub fn failed_attempts(&self) -> Option<&[AttemptError]> {
        self.history.as_ref().map(AttemptHistory::failed_attempts)
    }

    pub fn attempt_count(&self) -> Option<usize> {
        self.history.as_ref().map(AttemptHistory::attempt_count)
    }

    pub(crate) fn with_history(mut self, history: AttemptHistory) -> Self {
        self.history = Some(history);
        self
    }
}

/// Builds the response of a finished attempt.
///
/// A JSON body that fails to parse is reported before the status is looked
/// at, so it fails even a 2xx response.
pub fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    raw_body: Bytes,
    timings: Option<PhaseTimings>,
) -> Result<Response, AttemptError> {
    let mut response = Response {
        status,
        headers,
        raw_body,
        body: ResponseBody::Empty,
        timings,
        history: None,
    };

    if !response.raw_body.is_empty() {
        if is_json_content(&response.headers) {
            match serde_json::from_slice::<Value>(&response.raw_body) {
                Ok(value) => response.body = ResponseBody::Json(value),
                Err(source) => {
                    response.body = ResponseBody::Text(response.text_lossy());
                    return Err(AttemptError::UnparseableBody {
                        response: Box::new(response),
                        source,
                    });
                }
            }
        } else {
            response.body = ResponseBody::Text(response.text_lossy());
        }
    }

    if response.ok() {
        Ok(response)
    } else {
        Err(AttemptError::HttpStatus {
            response: Box::new(response),
        })
    }
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("application/json"))
}
