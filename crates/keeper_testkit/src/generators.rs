//! Property-based test generators using proptest.
//!
//! Provides strategies for valid paths, payloads, raw session event
//! sequences and multi-op batches.

use keeper_client::{CreateMode, KeeperError, Op, SessionEvent, ANY_VERSION};
use proptest::prelude::*;

/// Strategy for a single valid node name.
pub fn node_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,11}").expect("Invalid regex")
}

/// Strategy for valid absolute paths one to four levels deep.
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(node_name_strategy(), 1..=4)
        .prop_map(|names| format!("/{}", names.join("/")))
}

/// Strategy for node payloads, sometimes highly repetitive.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..512),
        (any::<u8>(), 0usize..4096).prop_map(|(byte, len)| vec![byte; len]),
    ]
}

/// Strategy for create modes.
pub fn create_mode_strategy() -> impl Strategy<Value = CreateMode> {
    prop_oneof![
        Just(CreateMode::Persistent),
        Just(CreateMode::PersistentSequential),
        Just(CreateMode::Ephemeral),
        Just(CreateMode::EphemeralSequential),
    ]
}

/// Strategy for connection-level errors a retry policy may act on.
pub fn recoverable_error_strategy() -> impl Strategy<Value = KeeperError> {
    prop_oneof![
        Just(KeeperError::ConnectionLoss),
        Just(KeeperError::OperationTimeout),
        Just(KeeperError::SessionMoved),
    ]
}

/// Strategy for tree-state errors that must never be retried.
pub fn domain_error_strategy() -> impl Strategy<Value = KeeperError> {
    prop_oneof![
        Just(KeeperError::NoNode),
        Just(KeeperError::NodeExists),
        Just(KeeperError::BadVersion),
        Just(KeeperError::NotEmpty),
        Just(KeeperError::NoAuth),
    ]
}

/// Strategy for raw session events drawn from a small pool of session ids.
///
/// Small ids make same-session reconnects and session changes both likely.
pub fn session_event_strategy() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        4 => (1i64..4).prop_map(SessionEvent::connected),
        1 => (1i64..4).prop_map(SessionEvent::connected_read_only),
        3 => Just(SessionEvent::Disconnected),
        1 => Just(SessionEvent::Expired),
        1 => Just(SessionEvent::AuthFailed),
    ]
}

/// Strategy for a sequence of raw session events.
pub fn session_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<SessionEvent>> {
    prop::collection::vec(session_event_strategy(), 0..max_len)
}

/// Strategy for a multi batch over `parent`.
///
/// Creates distinct children, then checks and updates some of them, so the
/// batch succeeds when `parent` exists and is empty.
pub fn multi_batch_strategy(parent: &'static str) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::btree_set(node_name_strategy(), 1..6).prop_flat_map(move |names| {
        let names: Vec<String> = names.into_iter().collect();
        let len = names.len();
        (Just(names), prop::collection::vec(any::<bool>(), len)).prop_map(move |(names, touch)| {
            let mut ops = Vec::new();
            for name in &names {
                ops.push(Op::create(
                    format!("{parent}/{name}"),
                    name.as_bytes().to_vec(),
                    CreateMode::Persistent,
                ));
            }
            for (name, touch) in names.iter().zip(touch) {
                if touch {
                    let path = format!("{parent}/{name}");
                    ops.push(Op::check(path.clone(), 0));
                    ops.push(Op::set_data(path, b"touched".to_vec(), ANY_VERSION));
                }
            }
            ops
        })
    })
}
