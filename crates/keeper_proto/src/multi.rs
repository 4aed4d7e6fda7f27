//! Atomic multi-operation requests and results.

use crate::acl::Acl;
use crate::error::KeeperError;
use crate::types::{CreateMode, Stat};

/// One constituent of an atomic multi request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Create a node.
    Create {
        /// Node path.
        path: String,
        /// Initial data.
        data: Vec<u8>,
        /// ACL; an empty list asks the client to inject its provider ACL.
        acl: Vec<Acl>,
        /// Creation mode.
        mode: CreateMode,
    },
    /// Delete a node.
    Delete {
        /// Node path.
        path: String,
        /// Expected version, or [`crate::ANY_VERSION`].
        version: i32,
    },
    /// Replace a node's data.
    SetData {
        /// Node path.
        path: String,
        /// New data.
        data: Vec<u8>,
        /// Expected version, or [`crate::ANY_VERSION`].
        version: i32,
    },
    /// Assert a node's version without changing it.
    Check {
        /// Node path.
        path: String,
        /// Expected version.
        version: i32,
    },
}

impl Op {
    /// Creates a `Create` op that takes the client's default ACL.
    pub fn create(path: impl Into<String>, data: Vec<u8>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data,
            acl: Vec::new(),
            mode,
        }
    }

    /// Creates a `Delete` op.
    pub fn delete(path: impl Into<String>, version: i32) -> Self {
        Op::Delete {
            path: path.into(),
            version,
        }
    }

    /// Creates a `SetData` op.
    pub fn set_data(path: impl Into<String>, data: Vec<u8>, version: i32) -> Self {
        Op::SetData {
            path: path.into(),
            data,
            version,
        }
    }

    /// Creates a `Check` op.
    pub fn check(path: impl Into<String>, version: i32) -> Self {
        Op::Check {
            path: path.into(),
            version,
        }
    }

    /// Returns the path this op targets.
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Delete { path, .. }
            | Op::SetData { path, .. }
            | Op::Check { path, .. } => path,
        }
    }

    /// Returns the same op retargeted at `path`.
    pub fn with_path(self, new_path: String) -> Self {
        match self {
            Op::Create {
                data, acl, mode, ..
            } => Op::Create {
                path: new_path,
                data,
                acl,
                mode,
            },
            Op::Delete { version, .. } => Op::Delete {
                path: new_path,
                version,
            },
            Op::SetData { data, version, .. } => Op::SetData {
                path: new_path,
                data,
                version,
            },
            Op::Check { version, .. } => Op::Check {
                path: new_path,
                version,
            },
        }
    }
}

/// Outcome of one constituent of a multi request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// The node was created at the given path.
    Create {
        /// Assigned path (including any sequence suffix).
        path: String,
    },
    /// The node was deleted.
    Delete,
    /// The node's data was replaced.
    SetData {
        /// Metadata after the write.
        stat: Stat,
    },
    /// The version check passed.
    Check,
    /// This constituent failed (or was rolled back because another one did).
    Error(KeeperError),
}

impl OpResult {
    /// Returns the error carried by this result, if any.
    pub fn error(&self) -> Option<KeeperError> {
        match self {
            OpResult::Error(err) => Some(*err),
            _ => None,
        }
    }
}
