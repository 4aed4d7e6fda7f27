//! Node metadata and creation modes.

use serde::{Deserialize, Serialize};

/// Version value that matches any node version in conditional calls.
pub const ANY_VERSION: i32 = -1;

/// Node metadata returned by reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Transaction id that last modified the node.
    pub mzxid: i64,
    /// Creation time in milliseconds since the epoch.
    pub ctime: i64,
    /// Last modification time in milliseconds since the epoch.
    pub mtime: i64,
    /// Number of data changes.
    pub version: i32,
    /// Number of child list changes.
    pub cversion: i32,
    /// Number of ACL changes.
    pub aversion: i32,
    /// Owning session id for ephemeral nodes, zero otherwise.
    pub ephemeral_owner: i64,
    /// Length of the data field.
    pub data_length: i32,
    /// Number of children.
    pub num_children: i32,
    /// Transaction id that last modified the children.
    pub pzxid: i64,
}

/// How a node is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Node survives the creating session.
    #[default]
    Persistent,
    /// Node is deleted when the creating session ends.
    Ephemeral,
    /// Persistent node with a monotonically increasing suffix.
    PersistentSequential,
    /// Ephemeral node with a monotonically increasing suffix.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true if the node is bound to its session.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Returns true if the server appends a sequence suffix.
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    /// Converts to the wire flag value.
    pub fn to_flags(&self) -> i32 {
        match self {
            CreateMode::Persistent => 0,
            CreateMode::Ephemeral => 1,
            CreateMode::PersistentSequential => 2,
            CreateMode::EphemeralSequential => 3,
        }
    }

    /// Converts from a wire flag value.
    pub fn from_flags(flags: i32) -> Option<Self> {
        match flags {
            0 => Some(CreateMode::Persistent),
            1 => Some(CreateMode::Ephemeral),
            2 => Some(CreateMode::PersistentSequential),
            3 => Some(CreateMode::EphemeralSequential),
            _ => None,
        }
    }
}
