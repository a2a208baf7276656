//! Error types for minigd

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of one step function on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: Uuid,
    pub error: String,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node, self.error)
    }
}

fn join_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Precondition Errors ===
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    #[error("Volume {name} is already {status}")]
    VolumeInState { name: String, status: String },

    #[error("Volume {0} is not started")]
    VolumeNotStarted(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer already in cluster: {0}")]
    PeerExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Lock Errors ===
    #[error("Timed out acquiring lock {0}")]
    LockTimeout(String),

    #[error("Lock {name} is held by {holder}")]
    LockConflict { name: String, holder: String },

    // === Dispatch Errors ===
    #[error("Step function not registered: {0}")]
    StepNotRegistered(String),

    #[error("Step {step} failed on {}", join_failures(.failures))]
    StepFailed {
        step: String,
        failures: Vec<NodeFailure>,
    },

    #[error("Transaction {txn} cancelled during step {step}")]
    Cancelled { txn: Uuid, step: String },

    #[error("Invalid transaction: {0}")]
    InvalidTxn(String),

    // === Compensation Errors ===
    #[error("{cause}; rollback incomplete, undo failed on {}", join_failures(.undo_failures))]
    RollbackFailed {
        cause: Box<Error>,
        undo_failures: Vec<NodeFailure>,
    },

    // === Context Errors ===
    #[error("Context key not found: {0}")]
    KeyNotFound(String),

    #[error("Context key {key} holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Store Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::LockTimeout(_)
        )
    }

    /// Did the remote side possibly apply the call?
    ///
    /// Timeouts and transport failures leave the outcome unknown; an error
    /// returned by the step function itself does not.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Http(_) | Error::Cancelled { .. }
        )
    }

    /// The failure that started a rollback, without the undo report
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::VolumeNotFound(_) | Error::PeerNotFound(_) => StatusCode::NOT_FOUND,
            Error::VolumeExists(_)
            | Error::VolumeInState { .. }
            | Error::VolumeNotStarted(_)
            | Error::PeerExists(_)
            | Error::InvalidRequest(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::LockConflict { .. } => StatusCode::CONFLICT,
            Error::LockTimeout(_) | Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::RollbackFailed { cause, .. } => cause.to_http_status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::VolumeNotFound("v".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::VolumeInState {
                name: "v".into(),
                status: "started".into()
            }
            .to_http_status(),
            StatusCode::BAD_REQUEST
        );
        let not_started = Error::VolumeNotStarted("v".into());
        assert_eq!(not_started.to_http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(not_started.to_string(), "Volume v is not started");
        let failed = Error::StepFailed {
            step: "vol-start.Commit".into(),
            failures: vec![],
        };
        assert_eq!(failed.to_http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rollback_error_keeps_cause() {
        let node = Uuid::new_v4();
        let err = Error::RollbackFailed {
            cause: Box::new(Error::LockConflict {
                name: "vol1".into(),
                holder: "other".into(),
            }),
            undo_failures: vec![NodeFailure {
                node,
                error: "boom".into(),
            }],
        };
        assert!(matches!(err.root_cause(), Error::LockConflict { .. }));
        assert_eq!(err.to_http_status(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionFailed("n2".into()).is_retryable());
        assert!(Error::LockTimeout("vol1".into()).is_retryable());
        assert!(!Error::PeerExists("n2".into()).is_retryable());
    }
}
