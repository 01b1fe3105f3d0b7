//! Error taxonomy shared by the node client, the engine and the tracker.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Login rejected (bad credentials or missing password). Never retried.
    #[error("authentication failed for {node}: {reason}")]
    Authentication { node: String, reason: String },

    /// The node rejected an established session mid-operation.
    #[error("session rejected by node: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// The node answered but refused the request.
    #[error("node rejected request: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse error class, used as part of an incident signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Network,
    NotFound,
    Validation,
    Remote,
    Config,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Remote => "remote",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } | Error::Unauthorized(_) => ErrorKind::Authentication,
            Error::Network(_) | Error::RetriesExhausted { .. } => ErrorKind::Network,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Remote(_) => ErrorKind::Remote,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Errors that abandon a whole pass rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Authentication { .. } | Error::Unauthorized(_) | Error::Config(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Error::Remote(format!("malformed response: {e}"));
        }
        match e.status() {
            Some(status) if status.is_client_error() => Error::Remote(e.to_string()),
            _ => Error::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::NotFound("job 1".into()).is_retryable());
        assert!(!Error::Remote("bad".into()).is_retryable());
        assert!(!Error::Authentication {
            node: "OCR ETHEREUM".into(),
            reason: "bad password".into()
        }
        .is_retryable());
    }

    #[test]
    fn exhausted_retries_keep_network_class() {
        let err = Error::RetriesExhausted {
            operation: "approve_job".into(),
            attempts: 3,
            last: Box::new(Error::Network("timeout".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("after 3 attempt(s)"));
    }
}
