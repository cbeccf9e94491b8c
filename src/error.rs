//! Error types for reson-ui

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{DecodeError, MessageType};
use crate::lifecycle::Phase;

/// Result type alias for reson-ui operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric codes carried in `error` envelopes sent across the boundary
pub mod codes {
    /// Malformed envelope or duplicate request id
    pub const INVALID_REQUEST: i64 = -32600;
    /// No handler bound for the requested capability
    pub const UNSUPPORTED: i64 = -32601;
    /// Bridge-internal failure (handler panic, serialization)
    pub const INTERNAL: i64 = -32603;
    /// Capability handler returned an error
    pub const HANDLER_FAILED: i64 = -32000;
    /// Request exceeded its deadline
    pub const TIMEOUT: i64 = -32001;
    /// Request cancelled by session teardown
    pub const CANCELLED: i64 = -32002;
}

/// Error type for bridge operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Inbound message failed envelope validation
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A pending request with this id already exists
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    /// Pending request received no reply before its deadline
    #[error("Request {request_id} timed out after {}ms", after.as_millis())]
    Timeout { request_id: String, after: Duration },

    /// Pending request was cancelled (session teardown)
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Operation attempted on a disposed session
    #[error("Session disposed")]
    Disposed,

    /// Operation attempted before the surface was mounted
    #[error("Session not mounted")]
    NotMounted,

    /// Lifecycle transition not permitted from the current phase
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    /// Outbound buffer is full while waiting for the guest to become ready
    #[error("Outbound buffer full ({0} messages queued before ready)")]
    BufferFull(usize),

    /// No handler is bound for this capability
    #[error("Unsupported operation: {0}")]
    Unsupported(MessageType),

    /// Message type cannot travel in the requested direction
    #[error("Message type {0} cannot be sent to the guest")]
    InvalidDirection(MessageType),

    /// Capability handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Guest answered a host request with an error envelope
    #[error("Guest error {code}: {message}")]
    Guest { code: i64, message: String },

    /// Transport error (send failed, listener closed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Rendering surface could not be created or failed to load
    #[error("Surface load error: {0}")]
    SurfaceLoad(String),

    /// Resource descriptor content cannot be rendered
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation needs a tokio runtime and none is running
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Blob payload was not valid base64
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Code placed in the `error` envelope when this error crosses the boundary
    pub fn code(&self) -> i64 {
        match self {
            Error::Decode(_) | Error::DuplicateRequestId(_) => codes::INVALID_REQUEST,
            Error::Unsupported(_) => codes::UNSUPPORTED,
            Error::Handler(_) => codes::HANDLER_FAILED,
            Error::Guest { code, .. } => *code,
            Error::Timeout { .. } => codes::TIMEOUT,
            Error::Cancelled(_) | Error::Disposed => codes::CANCELLED,
            _ => codes::INTERNAL,
        }
    }

    /// Check if the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if the error came from session teardown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout {
            request_id: "host-1".to_string(),
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Request host-1 timed out after 250ms");
        assert_eq!(Error::Disposed.to_string(), "Session disposed");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::Unsupported(MessageType::ToolCallRequest).code(),
            codes::UNSUPPORTED
        );
        assert_eq!(Error::Handler("boom".into()).code(), codes::HANDLER_FAILED);
        assert_eq!(
            Error::Guest {
                code: 7,
                message: "nope".into()
            }
            .code(),
            7
        );
        assert_eq!(Error::Transport("closed".into()).code(), codes::INTERNAL);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(Error::Cancelled("disposed".into()).is_cancelled());
        assert!(!Error::Disposed.is_timeout());
        assert!(Error::Timeout {
            request_id: "x".into(),
            after: Duration::ZERO
        }
        .is_timeout());
    }
}
