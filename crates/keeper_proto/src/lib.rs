//! # Keeper Protocol
//!
//! Raw protocol types shared by the Keeper client engine and its drivers.
//!
//! This crate provides:
//! - `Stat`, `Acl`, `Perms` and `CreateMode` node metadata
//! - `KeeperError` raw result codes and their recoverable/domain split
//! - `SessionEvent` and `WatchedEvent` raw notifications
//! - `Op` / `OpResult` for atomic multi requests
//! - Path validation and namespace helpers
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod acl;
mod error;
mod event;
mod multi;
pub mod path;
mod types;

pub use acl::{Acl, Id, Perms};
pub use error::{KeeperError, KeeperResult};
pub use event::{EventType, SessionEvent, SessionId, WatchedEvent};
pub use multi::{Op, OpResult};
pub use path::PathError;
pub use types::{CreateMode, Stat, ANY_VERSION};
