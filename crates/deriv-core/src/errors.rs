//! Error taxonomy for the Deriv API client.
//!
//! - [`ApiError`]: everything a caller or the error channel can observe
//! - [`ResponseError`]: an application error object returned for one call
//! - [`ClosureCause`]: why the connection went away, and from which side
//!
//! `ApiError` is `Clone`: a single closure cause is fanned out to every
//! pending call, every open stream and the error channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::ReqId;
use crate::wire;

/// Which side initiated a connection closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseOrigin {
    /// Closed by this client (`disconnect`, shutdown).
    Local,
    /// Closed by the server or the network.
    Remote,
}

impl fmt::Display for CloseOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Typed closure cause reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("connection closed by {origin} ({code}): {reason}")]
pub struct ClosureCause {
    /// Side that initiated the closure.
    pub origin: CloseOrigin,
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl ClosureCause {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Closed without a close frame.
    pub const ABNORMAL: u16 = 1006;

    /// A closure initiated by this client.
    pub fn local(code: u16, reason: impl Into<String>) -> Self {
        Self {
            origin: CloseOrigin::Local,
            code,
            reason: reason.into(),
        }
    }

    /// A closure initiated by the peer or the network.
    pub fn remote(code: u16, reason: impl Into<String>) -> Self {
        Self {
            origin: CloseOrigin::Remote,
            code,
            reason: reason.into(),
        }
    }

    /// Whether this client initiated the closure.
    pub fn is_local(&self) -> bool {
        self.origin == CloseOrigin::Local
    }
}

/// Application-level error returned by the server for a specific call.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("ResponseError: {message}")]
pub struct ResponseError {
    /// Server error code (e.g. `InvalidSymbol`).
    pub code: String,
    /// Server error message.
    pub message: String,
    /// Correlation id of the failed call.
    pub req_id: Option<ReqId>,
    /// Message type of the failed response.
    pub msg_type: Option<String>,
    /// The full response, for callers that need more than code and message.
    pub response: Value,
}

impl ResponseError {
    /// Build from a response carrying an `error` object.
    ///
    /// Returns `None` when the response has no error.
    pub fn from_response(response: &Value) -> Option<Self> {
        if !wire::has_error(response) {
            return None;
        }
        let err = &response[wire::ERROR];
        Some(Self {
            code: err["code"].as_str().unwrap_or("UnknownError").to_string(),
            message: err["message"].as_str().unwrap_or_default().to_string(),
            req_id: wire::req_id(response),
            msg_type: wire::msg_type(response).map(String::from),
            response: response.clone(),
        })
    }
}

/// Top-level error type for every engine operation.
#[derive(Clone, Debug, Error)]
pub enum ApiError {
    /// Invalid configuration; never retried.
    #[error("ConstructionError: {0}")]
    Construction(String),

    /// Sending or receiving failed without the peer reporting an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is closed.
    #[error("{0}")]
    Connection(#[from] ClosureCause),

    /// The server returned an error object for a call.
    #[error("{0}")]
    Response(Box<ResponseError>),

    /// Engine-internal anomaly (unroutable message, malformed frame).
    #[error("APIError: {0}")]
    Api(String),

    /// A background task registered with a label failed.
    #[error("deriv_api:{label}: {message}")]
    Task {
        /// Caller-supplied task label.
        label: String,
        /// Failure message.
        message: String,
    },
}

impl ApiError {
    /// Inbound message that no caller or stream was waiting for.
    pub fn extra_response() -> Self {
        Self::Api("Extra response".into())
    }

    /// Closure cause, when this is a connection error.
    pub fn closure(&self) -> Option<&ClosureCause> {
        match self {
            Self::Connection(cause) => Some(cause),
            _ => None,
        }
    }

    /// Response error, when the server rejected the call.
    pub fn response(&self) -> Option<&ResponseError> {
        match self {
            Self::Response(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResponseError> for ApiError {
    fn from(err: ResponseError) -> Self {
        Self::Response(Box::new(err))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn response_error_from_response() {
        let msg = json!({
            "msg_type": "tick",
            "req_id": 4,
            "error": {"code": "TestError", "message": "test error message"},
        });
        let err = ResponseError::from_response(&msg).unwrap();
        assert_eq!(err.code, "TestError");
        assert_eq!(err.req_id, Some(ReqId::new(4)));
        assert_eq!(err.msg_type.as_deref(), Some("tick"));
        assert_eq!(err.to_string(), "ResponseError: test error message");
    }

    #[test]
    fn response_error_absent_without_error_field() {
        assert!(ResponseError::from_response(&json!({"msg_type": "ping"})).is_none());
    }

    #[test]
    fn extra_response_display() {
        assert_eq!(ApiError::extra_response().to_string(), "APIError: Extra response");
    }

    #[test]
    fn closure_cause_display_and_origin() {
        let cause = ClosureCause::remote(1234, "Closed by remote");
        assert!(!cause.is_local());
        assert_eq!(
            cause.to_string(),
            "connection closed by remote (1234): Closed by remote"
        );
        let err = ApiError::from(cause.clone());
        assert_eq!(err.closure(), Some(&cause));
        assert!(ClosureCause::local(ClosureCause::NORMAL, "bye").is_local());
    }

    #[test]
    fn task_error_display() {
        let err = ApiError::Task {
            label: "raise an exception".into(),
            message: "test add_task".into(),
        };
        assert_eq!(err.to_string(), "deriv_api:raise an exception: test add_task");
    }

    #[test]
    fn response_conversion_boxes() {
        let inner = ResponseError::from_response(&json!({"error": {"code": "A", "message": "b"}}))
            .unwrap();
        let err: ApiError = inner.into();
        assert_matches!(err, ApiError::Response(ref e) if e.code == "A");
        assert_eq!(err.response().map(|e| e.message.as_str()), Some("b"));
    }
}
