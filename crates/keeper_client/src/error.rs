//! Error types for the client engine.

use keeper_proto::{KeeperError, OpResult, PathError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// The terminal error of a logical operation.
///
/// A caller always receives either a successful result or exactly one of
/// these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Compressing or decompressing a payload failed.
    #[error("encoding error on {path}: {message}")]
    Encoding {
        /// Path whose payload failed.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// The session is lost; re-issue once the connection recovers.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection stayed unusable past the connection timeout.
    #[error("timed out waiting for a usable connection")]
    SuspendedTimeout,

    /// Connection-level failures outlasted the retry policy.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Raw attempts made.
        attempts: u32,
        /// The last underlying failure.
        source: KeeperError,
    },

    /// The ensemble answered with a tree-state error.
    #[error(transparent)]
    Domain(#[from] KeeperError),

    /// A constituent of an atomic multi failed.
    #[error("multi operation failed: {}", first_failure(.results))]
    MultiOpFailed {
        /// Per-constituent results.
        results: Vec<OpResult>,
    },

    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the call.
    #[error("operation cancelled")]
    Cancelled,

    /// The ACL provider failed or produced an unusable ACL.
    #[error("ACL provider error for {path}: {message}")]
    AclProvider {
        /// Path the ACL was requested for.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// The path is not a valid node path.
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// Dialing the ensemble failed.
    #[error("dial failed: {0}")]
    Dial(KeeperError),

    /// The client was closed.
    #[error("client is closed")]
    Closed,

    /// The client was started twice.
    #[error("client already started")]
    AlreadyStarted,
}

fn first_failure(results: &[OpResult]) -> String {
    results
        .iter()
        .enumerate()
        .find_map(|(idx, r)| r.error().map(|e| format!("op {idx}: {e}")))
        .unwrap_or_else(|| "unknown".into())
}

impl ClientError {
    /// Creates an encoding error.
    pub fn encoding(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encoding {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an ACL provider error.
    pub fn acl_provider(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AclProvider {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the raw code for domain errors.
    pub fn keeper_error(&self) -> Option<KeeperError> {
        match self {
            ClientError::Domain(err) => Some(*err),
            ClientError::RetriesExhausted { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Returns true if re-issuing the call later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionLost
                | ClientError::SuspendedTimeout
                | ClientError::RetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::ConnectionLost.is_retryable());
        assert!(ClientError::SuspendedTimeout.is_retryable());
        assert!(ClientError::RetriesExhausted {
            attempts: 3,
            source: KeeperError::ConnectionLoss
        }
        .is_retryable());

        assert!(!ClientError::Domain(KeeperError::NoNode).is_retryable());
        assert!(!ClientError::encoding("/a", "bad frame").is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ClientError::RetriesExhausted {
            attempts: 3,
            source: KeeperError::OperationTimeout,
        };
        assert_eq!(
            err.to_string(),
            "retries exhausted after 3 attempts: operation timeout"
        );

        let err = ClientError::MultiOpFailed {
            results: vec![OpResult::Check, OpResult::Error(KeeperError::BadVersion)],
        };
        assert_eq!(
            err.to_string(),
            "multi operation failed: op 1: version conflict"
        );

        assert_eq!(
            ClientError::Domain(KeeperError::NodeExists).to_string(),
            "node already exists"
        );
    }

    #[test]
    fn keeper_error_accessor() {
        assert_eq!(
            ClientError::from(KeeperError::NoNode).keeper_error(),
            Some(KeeperError::NoNode)
        );
        assert_eq!(ClientError::Closed.keeper_error(), None);
    }
}
