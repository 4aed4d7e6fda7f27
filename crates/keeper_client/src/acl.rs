//! ACL providers used on node creation and ACL-setting calls.

use keeper_proto::Acl;
use std::collections::HashMap;

/// Supplies the ACL applied to created nodes and `set_acl` calls.
pub trait AclProvider: Send + Sync {
    /// The ACL used when no per-path override exists.
    fn default_acl(&self) -> Vec<Acl>;

    /// A per-path override, if one exists. `path` is the caller's path,
    /// not the namespaced one sent to the server.
    fn acl_for_path(&self, path: &str) -> Option<Vec<Acl>>;
}

/// Applies one ACL list everywhere (open-unsafe by default).
#[derive(Debug, Clone)]
pub struct DefaultAclProvider {
    acl: Vec<Acl>,
}

impl DefaultAclProvider {
    /// Creates a provider returning `acl` for every path.
    pub fn new(acl: Vec<Acl>) -> Self {
        Self { acl }
    }
}

impl Default for DefaultAclProvider {
    fn default() -> Self {
        Self::new(Acl::open_unsafe())
    }
}

impl AclProvider for DefaultAclProvider {
    fn default_acl(&self) -> Vec<Acl> {
        self.acl.clone()
    }

    fn acl_for_path(&self, _path: &str) -> Option<Vec<Acl>> {
        None
    }
}

/// A default ACL plus exact-path overrides.
#[derive(Debug, Clone, Default)]
pub struct PathAclProvider {
    default: Vec<Acl>,
    overrides: HashMap<String, Vec<Acl>>,
}

impl PathAclProvider {
    /// Creates a provider with the given default.
    pub fn new(default: Vec<Acl>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Overrides the ACL for one path, keyed by the caller's path without
    /// the client namespace.
    pub fn with_path(mut self, path: impl Into<String>, acl: Vec<Acl>) -> Self {
        self.overrides.insert(path.into(), acl);
        self
    }
}

impl AclProvider for PathAclProvider {
    fn default_acl(&self) -> Vec<Acl> {
        self.default.clone()
    }

    fn acl_for_path(&self, path: &str) -> Option<Vec<Acl>> {
        self.overrides.get(path).cloned()
    }
}
