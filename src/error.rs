//! Error types for the embedstream gateway.
//!
//! Three layers of errors exist:
//! - [`InferenceError`]: scoped to one request, always turned into a
//!   correlated response on the stream
//! - [`BackendError`]: reported by an inference backend, converted into an
//!   [`InferenceError`] by the dispatcher
//! - [`Error`]: process-level failures (configuration, I/O, transport setup)

use std::fmt;
use std::result;
use thiserror::Error;
use tonic::Status;

/// A specialized Result type for gateway setup and lifecycle operations.
pub type Result<T> = result::Result<T, Error>;

/// Kind of a request-scoped failure, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Empty image or empty model name
    InvalidRequest,
    /// Model name not present in the catalog
    ModelNotFound,
    /// Backend cannot currently serve the model
    ModelUnavailable,
    /// Dispatcher queue for the model is at capacity
    Overloaded,
    /// Backend computation failed
    InferenceFailure,
    /// Task was cancelled by its session before completing
    Cancelled,
}

impl ErrorKind {
    /// Every kind, in wire-code order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::InvalidRequest,
        ErrorKind::ModelNotFound,
        ErrorKind::ModelUnavailable,
        ErrorKind::Overloaded,
        ErrorKind::InferenceFailure,
        ErrorKind::Cancelled,
    ];

    /// Stable snake_case label used in logs and metric snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure bound to a single request id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct InferenceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InferenceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn model_not_found(model: &str) -> Self {
        Self::new(
            ErrorKind::ModelNotFound,
            format!("The model name {} does not exist", model),
        )
    }

    pub fn overloaded(model: &str) -> Self {
        Self::new(
            ErrorKind::Overloaded,
            format!("Queue for model {} is full, back off and retry", model),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled by session")
    }
}

/// Errors reported by an inference backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend cannot serve this model right now (not loaded, unreachable)
    #[error("model '{model}' unavailable: {reason}")]
    Unavailable { model: String, reason: String },

    /// The backend accepted the request but the computation failed
    #[error("inference failed: {0}")]
    Failure(String),
}

impl BackendError {
    pub fn unavailable(model: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            model: model.into(),
            reason: reason.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        BackendError::Failure(message.into())
    }
}

impl From<BackendError> for InferenceError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable { .. } => {
                InferenceError::new(ErrorKind::ModelUnavailable, err.to_string())
            }
            BackendError::Failure(msg) => InferenceError::new(ErrorKind::InferenceFailure, msg),
        }
    }
}

/// The error type for gateway setup and lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend construction or probing errors
    #[error("Backend error: {0}")]
    Backend(String),

    /// gRPC transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(msg) => Status::failed_precondition(format!("Config error: {}", msg)),
            Error::Io(err) => Status::internal(format!("I/O error: {}", err)),
            Error::Backend(msg) => Status::unavailable(format!("Backend error: {}", msg)),
            Error::Transport(msg) => Status::unavailable(format!("Transport error: {}", msg)),
            Error::Internal(msg) => Status::internal(format!("Internal error: {}", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_maps_to_kind() {
        let unavailable: InferenceError = BackendError::unavailable("m", "not loaded").into();
        assert_eq!(unavailable.kind, ErrorKind::ModelUnavailable);
        assert!(unavailable.message.contains("not loaded"));

        let failure: InferenceError = BackendError::failure("nan in output").into();
        assert_eq!(failure.kind, ErrorKind::InferenceFailure);
        assert_eq!(failure.message, "nan in output");
    }

    #[test]
    fn test_error_messages() {
        let err = InferenceError::model_not_found("unknown-model");
        assert_eq!(
            err.to_string(),
            "model_not_found: The model name unknown-model does not exist"
        );

        let err = Error::Config("no models".to_string());
        assert_eq!(err.to_string(), "Configuration error: no models");
    }

    #[test]
    fn test_error_to_status() {
        let status: Status = Error::Config("bad".into()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: Status = Error::Transport("reset".into()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
