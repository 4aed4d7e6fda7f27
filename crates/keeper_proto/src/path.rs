//! Node path validation and namespace helpers.
//!
//! Paths are absolute, slash-separated and never end with a slash
//! (except the root `/`). Sequential creates are the one exception:
//! the server appends the sequence number, so a trailing slash is fine.

use thiserror::Error;

/// An invalid node path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid path {path:?}: {reason}")]
pub struct PathError {
    /// The offending path.
    pub path: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl PathError {
    fn new(path: &str, reason: &'static str) -> Self {
        Self {
            path: path.to_string(),
            reason,
        }
    }
}

/// Validates a node path.
pub fn validate_path(path: &str, sequential: bool) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::new(path, "path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(PathError::new(path, "path must start with /"));
    }
    if path.len() == 1 {
        return Ok(());
    }
    if path.ends_with('/') && !sequential {
        return Err(PathError::new(path, "path must not end with /"));
    }

    let body = path.strip_suffix('/').unwrap_or(path);
    for segment in body[1..].split('/') {
        match segment {
            "" => return Err(PathError::new(path, "empty node name")),
            "." | ".." => return Err(PathError::new(path, "relative paths not allowed")),
            _ => {}
        }
        if segment.chars().any(is_forbidden_char) {
            return Err(PathError::new(path, "invalid character in node name"));
        }
    }
    Ok(())
}

fn is_forbidden_char(c: char) -> bool {
    matches!(c,
        '\u{0000}'..='\u{001f}'
        | '\u{007f}'..='\u{009f}'
        | '\u{e000}'..='\u{f8ff}'
        | '\u{fff0}'..='\u{ffff}')
}

/// Joins a parent path and a child node name.
pub fn join(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent.is_empty() || parent == "/" {
        format!("/{child}")
    } else if child.is_empty() {
        parent.to_string()
    } else {
        format!("{}/{child}", parent.trim_end_matches('/'))
    }
}

/// Returns the parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Returns the last node name of `path`.
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Returns every proper ancestor of `path` from the top down, excluding root.
///
/// `/a/b/c` yields `["/a", "/a/b"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == "/" {
            break;
        }
        out.push(p.to_string());
        current = parent(p);
    }
    out.reverse();
    out
}

/// Prefixes `path` with the namespace, if any.
pub fn apply_namespace(namespace: Option<&str>, path: &str) -> String {
    match namespace {
        None => path.to_string(),
        Some(ns) => {
            let root = join("/", ns);
            if path == "/" {
                root
            } else {
                format!("{root}{path}")
            }
        }
    }
}

/// Removes the namespace prefix from a server-side path.
///
/// Paths outside the namespace are returned unchanged.
pub fn strip_namespace(namespace: Option<&str>, path: &str) -> String {
    let Some(ns) = namespace else {
        return path.to_string();
    };
    let root = join("/", ns);
    match path.strip_prefix(root.as_str()) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}
