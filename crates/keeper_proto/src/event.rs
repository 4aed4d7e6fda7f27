//! Raw session and watch notifications.

use std::fmt;
use std::time::Duration;

/// Identity assigned by the ensemble to an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// A raw event on a connection's session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection reached a server and the session is usable.
    Connected {
        /// Session the server associated with the connection.
        session_id: SessionId,
        /// Whether the server only accepts reads.
        read_only: bool,
        /// Session timeout negotiated with the server.
        negotiated_timeout: Duration,
    },
    /// The connection to the server dropped; the session may still be alive.
    Disconnected,
    /// The server expired the session.
    Expired,
    /// Authentication was rejected; the session is unusable.
    AuthFailed,
}

impl SessionEvent {
    /// Shorthand for a read-write `Connected` event.
    pub fn connected(session_id: i64) -> Self {
        SessionEvent::Connected {
            session_id: SessionId(session_id),
            read_only: false,
            negotiated_timeout: Duration::from_secs(30),
        }
    }

    /// Shorthand for a read-only `Connected` event.
    pub fn connected_read_only(session_id: i64) -> Self {
        SessionEvent::Connected {
            session_id: SessionId(session_id),
            read_only: true,
            negotiated_timeout: Duration::from_secs(30),
        }
    }
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The watched node was created.
    NodeCreated,
    /// The watched node was deleted.
    NodeDeleted,
    /// The watched node's data changed.
    NodeDataChanged,
    /// The watched node's children changed.
    NodeChildrenChanged,
    /// The driver dropped the watch without a change (e.g. session loss).
    NotWatching,
}

/// A one-shot watch notification from the raw connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What happened.
    pub event_type: EventType,
    /// Path of the node the watch was set on.
    pub path: String,
}

impl WatchedEvent {
    /// Creates a new watch notification.
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}
