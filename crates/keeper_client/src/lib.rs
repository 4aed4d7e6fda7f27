//! # Keeper Client
//!
//! A resilience layer in front of a raw, session-bound coordination-service
//! connection.
//!
//! This crate provides:
//! - Connection-state supervision (latent → connected → suspended → lost)
//! - Retry of connection-level failures through pluggable policies
//! - Transparent payload compression and ACL injection
//! - Watch re-arming across session churn
//! - Tracing hooks for every logical operation
//!
//! ## Architecture
//!
//! Callers talk to the [`Client`], which dereferences to the
//! [`OperationExecutor`]. Every operation snapshots the
//! [`ConnectionStateManager`], issues one raw call per attempt against the
//! current [`Session`], and classifies the outcome. A single supervisor
//! thread owns the raw session: it dials, consumes raw session events, and
//! drives the state machine and the [`WatchRegistry`] sweep.
//!
//! ## Key Invariants
//!
//! - Exactly one connection state is authoritative at any instant
//! - Transitions are published to listeners in the order they happen
//! - Domain and encoding errors are never retried
//! - A retry policy answering "stop" is always honoured
//! - Watches are re-armed before a new session is published as connected

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod acl;
mod client;
mod compression;
mod config;
mod connection;
mod context;
mod error;
mod executor;
pub mod mock;
mod retry;
mod state;
mod supervisor;
mod tracer;
mod watch;

pub use acl::{AclProvider, DefaultAclProvider, PathAclProvider};
pub use client::{Client, ClientBuilder};
pub use compression::{CompressionError, CompressionProvider, Lz4CompressionProvider, NoCompression};
pub use config::{AuthInfo, ClientConfig};
pub use connection::{Dialed, Dialer, EnsembleProvider, FixedEnsembleProvider, RawConnection, WatchReceiver};
pub use context::{CallContext, CancelToken};
pub use error::{ClientError, ClientResult};
pub use executor::{CreateOptions, DeleteOptions, OperationExecutor};
pub use retry::{
    BoundedExponentialBackoffRetry, ExponentialBackoffRetry, RetryDecision, RetryNTimes,
    RetryOneTime, RetryPolicy, RetrySleeper, RetryState, RetryUntilElapsed, ThreadSleeper,
};
pub use state::{ConnectionState, ConnectionStateManager, Session, StateEvent, StateSnapshot};
pub use tracer::{LoggingTracer, NoopTracer, TracerDriver};
pub use watch::{RemovalReason, WatchKind, WatchNotification, WatchRegistry, Watcher};

pub use keeper_proto::{
    Acl, CreateMode, EventType, Id, KeeperError, Op, OpResult, Perms, SessionEvent, SessionId,
    Stat, WatchedEvent, ANY_VERSION,
};
