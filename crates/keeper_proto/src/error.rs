//! Raw result codes returned by the coordination service.

use thiserror::Error;

/// Result type for raw driver calls.
pub type KeeperResult<T> = Result<T, KeeperError>;

/// Error codes a raw connection can report.
///
/// Codes split into two families. *Recoverable* codes describe the
/// connection, not the tree, and retrying the same call may succeed.
/// Every other code reflects actual tree state and is a *domain* error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeeperError {
    /// A system or server-side error.
    #[error("system error")]
    SystemError,
    /// A runtime inconsistency was found.
    #[error("runtime inconsistency")]
    RuntimeInconsistency,
    /// A data inconsistency was found.
    #[error("data inconsistency")]
    DataInconsistency,
    /// Connection to the server was lost while the call was in flight.
    #[error("connection loss")]
    ConnectionLoss,
    /// Error while marshalling or unmarshalling data.
    #[error("marshalling error")]
    MarshallingError,
    /// Operation is not implemented by the server.
    #[error("unimplemented")]
    Unimplemented,
    /// The call timed out before the server answered.
    #[error("operation timeout")]
    OperationTimeout,
    /// Invalid arguments.
    #[error("bad arguments")]
    BadArguments,
    /// Node does not exist.
    #[error("node does not exist")]
    NoNode,
    /// Not authenticated for the node.
    #[error("not authenticated")]
    NoAuth,
    /// Version check failed.
    #[error("version conflict")]
    BadVersion,
    /// Ephemeral nodes may not have children.
    #[error("ephemeral nodes may not have children")]
    NoChildrenForEphemerals,
    /// Node already exists.
    #[error("node already exists")]
    NodeExists,
    /// Node has children.
    #[error("node has children")]
    NotEmpty,
    /// The session has been expired by the server.
    #[error("session expired")]
    SessionExpired,
    /// Invalid ACL specified.
    #[error("invalid ACL specified")]
    InvalidAcl,
    /// Client authentication failed.
    #[error("authentication failed")]
    AuthFailed,
    /// The server is closing the session.
    #[error("session is closing")]
    Closing,
    /// Session moved to another server.
    #[error("session moved")]
    SessionMoved,
    /// A write was attempted against a read-only server.
    #[error("not a read-only call")]
    NotReadOnly,
}

impl KeeperError {
    /// Returns true for connection-level codes that are safe to retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KeeperError::ConnectionLoss
                | KeeperError::OperationTimeout
                | KeeperError::SessionExpired
                | KeeperError::SessionMoved
        )
    }

    /// Converts to the numeric wire code.
    pub fn to_code(&self) -> i32 {
        match self {
            KeeperError::SystemError => -1,
            KeeperError::RuntimeInconsistency => -2,
            KeeperError::DataInconsistency => -3,
            KeeperError::ConnectionLoss => -4,
            KeeperError::MarshallingError => -5,
            KeeperError::Unimplemented => -6,
            KeeperError::OperationTimeout => -7,
            KeeperError::BadArguments => -8,
            KeeperError::NoNode => -101,
            KeeperError::NoAuth => -102,
            KeeperError::BadVersion => -103,
            KeeperError::NoChildrenForEphemerals => -108,
            KeeperError::NodeExists => -110,
            KeeperError::NotEmpty => -111,
            KeeperError::SessionExpired => -112,
            KeeperError::InvalidAcl => -114,
            KeeperError::AuthFailed => -115,
            KeeperError::Closing => -116,
            KeeperError::SessionMoved => -118,
            KeeperError::NotReadOnly => -119,
        }
    }

    /// Converts from a numeric wire code.
    ///
    /// Returns `None` for `0` (success) and for unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -1 => KeeperError::SystemError,
            -2 => KeeperError::RuntimeInconsistency,
            -3 => KeeperError::DataInconsistency,
            -4 => KeeperError::ConnectionLoss,
            -5 => KeeperError::MarshallingError,
            -6 => KeeperError::Unimplemented,
            -7 => KeeperError::OperationTimeout,
            -8 => KeeperError::BadArguments,
            -101 => KeeperError::NoNode,
            -102 => KeeperError::NoAuth,
            -103 => KeeperError::BadVersion,
            -108 => KeeperError::NoChildrenForEphemerals,
            -110 => KeeperError::NodeExists,
            -111 => KeeperError::NotEmpty,
            -112 => KeeperError::SessionExpired,
            -114 => KeeperError::InvalidAcl,
            -115 => KeeperError::AuthFailed,
            -116 => KeeperError::Closing,
            -118 => KeeperError::SessionMoved,
            -119 => KeeperError::NotReadOnly,
            _ => return None,
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_codes() {
        assert!(KeeperError::ConnectionLoss.is_recoverable());
        assert!(KeeperError::OperationTimeout.is_recoverable());
        assert!(KeeperError::SessionExpired.is_recoverable());
        assert!(KeeperError::SessionMoved.is_recoverable());

        assert!(!KeeperError::NoNode.is_recoverable());
        assert!(!KeeperError::NodeExists.is_recoverable());
        assert!(!KeeperError::BadVersion.is_recoverable());
        assert!(!KeeperError::InvalidAcl.is_recoverable());
    }

    #[test]
    fn unknown_codes() {
        assert_eq!(KeeperError::from_code(0), None);
        assert_eq!(KeeperError::from_code(-9999), None);
        assert_eq!(KeeperError::from_code(-101), Some(KeeperError::NoNode));
    }

    #[test]
    fn error_display() {
        assert_eq!(KeeperError::NoNode.to_string(), "node does not exist");
        assert_eq!(KeeperError::ConnectionLoss.to_string(), "connection loss");
    }
}
