//! Access-control lists.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Permission bits granted by an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Perms(u32);

impl Perms {
    /// May read node data and list children.
    pub const READ: Perms = Perms(1);
    /// May set node data.
    pub const WRITE: Perms = Perms(1 << 1);
    /// May create children.
    pub const CREATE: Perms = Perms(1 << 2);
    /// May delete children.
    pub const DELETE: Perms = Perms(1 << 3);
    /// May set permissions.
    pub const ADMIN: Perms = Perms(1 << 4);
    /// Every permission.
    pub const ALL: Perms = Perms(0x1f);

    /// Creates permissions from raw bits. Unknown bits are dropped.
    pub fn from_bits(bits: u32) -> Self {
        Perms(bits & Self::ALL.0)
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is granted.
    pub fn contains(&self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no permission is granted.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Self) -> Self::Output {
        Perms(self.0 | rhs.0)
    }
}

/// An authentication identity (`scheme:id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    /// Authentication scheme (`world`, `auth`, `digest`, `ip`, ...).
    pub scheme: String,
    /// Scheme-specific identity.
    pub id: String,
}

impl Id {
    /// Creates a new identity.
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// The `world:anyone` identity.
    pub fn anyone() -> Self {
        Self::new("world", "anyone")
    }

    /// The `auth:` identity, standing for whoever created the node.
    pub fn creator() -> Self {
        Self::new("auth", "")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.id)
    }
}

/// A single access-control entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// Granted permissions.
    pub perms: Perms,
    /// Identity the permissions apply to.
    pub id: Id,
}

impl Acl {
    /// Creates a new ACL entry.
    pub fn new(perms: Perms, id: Id) -> Self {
        Self { perms, id }
    }

    /// A completely open list: everyone may do everything.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::ALL, Id::anyone())]
    }

    /// Everyone may read, nobody may write.
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::new(Perms::READ, Id::anyone())]
    }

    /// Grants every permission to the creator's authenticated identities.
    pub fn creator_all() -> Vec<Acl> {
        vec![Acl::new(Perms::ALL, Id::creator())]
    }
}
