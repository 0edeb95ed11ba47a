//! Error types for rpc-bridge

use crate::status::{Code, Status, Violation};
use thiserror::Error;

/// Main error type shared by the RPC path and the gateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("missing metadata")]
    MissingMetadata,

    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {reason}")]
    InvalidToken {
        reason: String,
        violations: Vec<Violation>,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("no route for {method} {path}")]
    Routing { method: String, path: String },

    #[error("{0}")]
    Handler(Status),

    #[error("stream closed")]
    StreamClosed,

    #[error("call cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create a routing error
    pub fn routing(method: impl Into<String>, path: impl Into<String>) -> Self {
        Error::Routing {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create an invalid token error with violation details
    pub fn invalid_token(reason: impl Into<String>, violations: Vec<Violation>) -> Self {
        Error::InvalidToken {
            reason: reason.into(),
            violations,
        }
    }

    /// Wrap a handler status
    pub fn handler(code: Code, message: impl Into<String>) -> Self {
        Error::Handler(Status::new(code, message))
    }

    /// Create an internal handler error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::handler(Code::Internal, msg)
    }

    /// RPC code for this error
    pub fn code(&self) -> Code {
        match self {
            Error::MissingMetadata | Error::MissingToken | Error::InvalidToken { .. } => {
                Code::Unauthenticated
            }
            Error::Decode(_) => Code::InvalidArgument,
            Error::Routing { .. } => Code::NotFound,
            Error::Handler(status) => status.code,
            Error::StreamClosed => Code::Aborted,
            Error::Cancelled => Code::Cancelled,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }

    /// Convert to a wire status, keeping violation details.
    pub fn to_status(&self) -> Status {
        match self {
            Error::Handler(status) => status.clone(),
            Error::InvalidToken { violations, .. } => {
                Status::new(self.code(), self.to_string()).with_details(violations.clone())
            }
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl From<Status> for Error {
    /// Statuses coming back from a peer. Cancellation and deadline codes are
    /// folded back into their dedicated variants.
    fn from(status: Status) -> Self {
        match status.code {
            Code::Cancelled => Error::Cancelled,
            Code::DeadlineExceeded => Error::DeadlineExceeded,
            _ => Error::Handler(status),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_unauthenticated() {
        assert_eq!(Error::MissingMetadata.code(), Code::Unauthenticated);
        assert_eq!(Error::MissingToken.code(), Code::Unauthenticated);
        assert_eq!(
            Error::invalid_token("expired", vec![]).code(),
            Code::Unauthenticated
        );
    }

    #[test]
    fn test_invalid_token_keeps_violations() {
        let err = Error::invalid_token(
            "token expired",
            vec![Violation::new("token expired", "please use a new token")],
        );
        let status = err.to_status();
        assert_eq!(status.code, Code::Unauthenticated);
        assert_eq!(status.details.len(), 1);
        assert_eq!(status.details[0].description, "please use a new token");
    }

    #[test]
    fn test_handler_status_passes_through() {
        let status = Status::new(Code::FailedPrecondition, "boom");
        let err = Error::from(status.clone());
        assert_eq!(err.to_status(), status);
        assert_eq!(err.to_string(), "failed precondition: boom");
    }

    #[test]
    fn test_peer_cancellation_folds_into_variant() {
        assert_eq!(
            Error::from(Status::new(Code::Cancelled, "x")),
            Error::Cancelled
        );
        assert_eq!(
            Error::from(Status::new(Code::DeadlineExceeded, "x")),
            Error::DeadlineExceeded
        );
    }

    #[test]
    fn test_decode_and_routing_codes() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(Error::from(json_err).code(), Code::InvalidArgument);
        assert_eq!(Error::routing("GET", "/x").code(), Code::NotFound);
    }
}
