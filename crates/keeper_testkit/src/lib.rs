//! # Keeper Testkit
//!
//! Test utilities for Keeper.
//!
//! This crate provides:
//! - An in-memory ensemble with real tree semantics and fault injection
//! - Recording tracer and counting sleeper collaborators
//! - Client fixtures wired to the in-memory ensemble
//! - Property-based test generators using proptest
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keeper_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_client() {
//!     let fixture = TestClient::connected();
//!     fixture.ensemble.disconnect(fixture.session_id());
//!     // ... issue operations, observe the state machine
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ensemble;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ensemble::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recording::*;
}

pub use ensemble::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recording::*;
