//! Raw driver abstraction.
//!
//! These traits are the narrow seam between the engine and whatever
//! driver speaks the ensemble's wire protocol. The engine never adds
//! operations beyond this set.

use keeper_proto::{Acl, CreateMode, KeeperResult, Op, OpResult, SessionEvent, Stat, WatchedEvent};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

/// Receiver of a one-shot raw watch.
///
/// The driver sends at most one event per watch. A disconnected receiver
/// means the driver dropped the watch with its session.
pub type WatchReceiver = Receiver<WatchedEvent>;

/// A raw, single-shot connection to the ensemble.
///
/// Calls fail with recoverable [`keeper_proto::KeeperError`] codes when the
/// connection is in trouble and with domain codes when the tree says no.
pub trait RawConnection: Send + Sync {
    /// Adds authentication credentials to the connection.
    fn add_auth(&self, scheme: &str, auth: &[u8]) -> KeeperResult<()>;

    /// Creates a node and returns its assigned path.
    fn create(&self, path: &str, data: &[u8], mode: CreateMode, acl: &[Acl])
        -> KeeperResult<String>;

    /// Returns the node's metadata, or `None` if it does not exist.
    fn exists(&self, path: &str) -> KeeperResult<Option<Stat>>;

    /// Like [`RawConnection::exists`], leaving an existence watch.
    fn exists_w(&self, path: &str) -> KeeperResult<(Option<Stat>, WatchReceiver)>;

    /// Returns the node's data and metadata.
    fn get(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)>;

    /// Like [`RawConnection::get`], leaving a data watch.
    fn get_w(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat, WatchReceiver)>;

    /// Replaces the node's data if its version matches.
    fn set(&self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat>;

    /// Deletes the node if its version matches.
    fn delete(&self, path: &str, version: i32) -> KeeperResult<()>;

    /// Lists the node's children.
    fn children(&self, path: &str) -> KeeperResult<(Vec<String>, Stat)>;

    /// Like [`RawConnection::children`], leaving a child watch.
    fn children_w(&self, path: &str) -> KeeperResult<(Vec<String>, Stat, WatchReceiver)>;

    /// Returns the node's ACL.
    fn get_acl(&self, path: &str) -> KeeperResult<(Vec<Acl>, Stat)>;

    /// Replaces the node's ACL if its ACL version matches.
    fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> KeeperResult<Stat>;

    /// Applies all ops atomically.
    ///
    /// A constituent failure is reported through `Ok` with
    /// [`OpResult::Error`] entries; `Err` is reserved for failures of the
    /// request as a whole.
    fn multi(&self, ops: &[Op]) -> KeeperResult<Vec<OpResult>>;

    /// Flushes the leader channel for `path`.
    fn sync(&self, path: &str) -> KeeperResult<String>;

    /// Closes the connection and its session event channel.
    fn close(&self);
}

/// A freshly dialed connection and its raw session event channel.
pub struct Dialed {
    /// The raw connection handle.
    pub connection: Arc<dyn RawConnection>,
    /// Raw session events for this connection.
    pub events: Receiver<SessionEvent>,
}

/// Opens raw connections. A pure factory with no state of its own.
pub trait Dialer: Send + Sync {
    /// Dials the ensemble.
    fn dial(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        can_be_read_only: bool,
    ) -> KeeperResult<Dialed>;
}

/// Supplies the connect string at every dial.
pub trait EnsembleProvider: Send + Sync {
    /// The connect string to dial next.
    fn connection_string(&self) -> String;
}

/// An ensemble provider with a fixed connect string.
#[derive(Debug, Clone)]
pub struct FixedEnsembleProvider {
    connect_string: String,
}

impl FixedEnsembleProvider {
    /// Creates the provider.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
        }
    }
}

impl EnsembleProvider for FixedEnsembleProvider {
    fn connection_string(&self) -> String {
        self.connect_string.clone()
    }
}
