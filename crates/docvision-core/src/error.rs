//! Error types for the docvision pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::JobStatus;

/// Result type alias using docvision's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipeline operations.
///
/// The first group of variants is the job failure taxonomy and maps onto a
/// persisted [`ErrorKind`]; the rest are infrastructure errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The source file is missing, truncated, or has no renderable pages.
    #[error("Unreadable document: {0}")]
    UnreadableDocument(String),

    /// The file is neither a PDF nor a supported raster image.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The backend could not be started or reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A model call exceeded its timeout.
    #[error("Inference timed out after {0}s")]
    InferenceTimeout(u64),

    /// The backend answered with malformed or empty output.
    #[error("Inference error: {0}")]
    InferenceError(String),

    /// The vector store could not be reached.
    #[error("Vector store unreachable: {0}")]
    VectorStoreUnreachable(String),

    /// The job was cancelled.
    #[error("Job cancelled")]
    Cancelled,

    /// The process stopped while the job was in flight.
    #[error("Job interrupted by restart")]
    Interrupted,

    /// A status change outside the allowed edges was attempted.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Failure category persisted on the job.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnreadableDocument(_) => ErrorKind::UnreadableDocument,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::InferenceTimeout(_) => ErrorKind::InferenceTimeout,
            Error::InferenceError(_) => ErrorKind::InferenceError,
            Error::VectorStoreUnreachable(_) => ErrorKind::VectorStoreUnreachable,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Interrupted => ErrorKind::Interrupted,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

/// Persisted failure category of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableDocument,
    UnsupportedFormat,
    BackendUnavailable,
    InferenceTimeout,
    InferenceError,
    VectorStoreUnreachable,
    Cancelled,
    Interrupted,
    Internal,
}

impl ErrorKind {
    /// Transient failures the router retries with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::InferenceTimeout | ErrorKind::InferenceError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnreadableDocument => "unreadable_document",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::InferenceTimeout => "inference_timeout",
            ErrorKind::InferenceError => "inference_error",
            ErrorKind::VectorStoreUnreachable => "vector_store_unreachable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unreadable_document" => Ok(ErrorKind::UnreadableDocument),
            "unsupported_format" => Ok(ErrorKind::UnsupportedFormat),
            "backend_unavailable" => Ok(ErrorKind::BackendUnavailable),
            "inference_timeout" => Ok(ErrorKind::InferenceTimeout),
            "inference_error" => Ok(ErrorKind::InferenceError),
            "vector_store_unreachable" => Ok(ErrorKind::VectorStoreUnreachable),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "interrupted" => Ok(ErrorKind::Interrupted),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(Error::Serialization(format!("unknown error kind: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unreadable() {
        let err = Error::UnreadableDocument("zero pages".to_string());
        assert_eq!(err.to_string(), "Unreadable document: zero pages");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::InferenceTimeout(300);
        assert_eq!(err.to_string(), "Inference timed out after 300s");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Inferring,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition from completed to inferring"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::BackendUnavailable("x".into()).kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Internal);
        assert_eq!(
            Error::VectorStoreUnreachable("x".into()).kind(),
            ErrorKind::VectorStoreUnreachable
        );
    }

    #[test]
    fn test_only_timeouts_and_inference_errors_retry() {
        assert!(Error::InferenceTimeout(1).is_retryable());
        assert!(Error::InferenceError("empty".into()).is_retryable());
        assert!(!Error::BackendUnavailable("down".into()).is_retryable());
        assert!(!Error::UnsupportedFormat("docx".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kind_round_trips_through_str() {
        for kind in [
            ErrorKind::UnreadableDocument,
            ErrorKind::UnsupportedFormat,
            ErrorKind::BackendUnavailable,
            ErrorKind::InferenceTimeout,
            ErrorKind::InferenceError,
            ErrorKind::VectorStoreUnreachable,
            ErrorKind::Cancelled,
            ErrorKind::Interrupted,
            ErrorKind::Internal,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
