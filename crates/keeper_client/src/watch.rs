//! Watch bookkeeping across session churn.
//!
//! Every watch-bearing read leaves a record here. A record remembers the
//! session generation its raw watch is armed on. When a new session is
//! established, the supervisor calls [`WatchRegistry::rearm`] before the
//! session is published, and every record armed on an older generation is
//! re-issued against the new session. Callers observe one channel per watch
//! through a [`Watcher`] for its whole lifetime.

use crate::connection::{RawConnection, WatchReceiver};
use crate::state::Session;
use keeper_proto::path::strip_namespace;
use keeper_proto::{EventType, KeeperError, KeeperResult, WatchedEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Generation of a record whose raw watch is gone.
const STALE: u64 = 0;

/// How often a forwarder checks that its record is still armed.
const FORWARD_POLL: Duration = Duration::from_millis(50);

/// What a watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation or deletion of the node, or a data change.
    Exists,
    /// Data change or deletion of an existing node.
    Data,
    /// Changes to the node's child list.
    Children,
}

/// Why a watch was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The watched node no longer exists on the new session.
    NodeGone,
    /// Re-arming failed with a non-transient error.
    RearmFailed(KeeperError),
    /// The client was closed.
    ClientClosed,
}

/// A notification delivered to a [`Watcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    /// The watch fired. This is the last notification of the watch.
    Event(WatchedEvent),
    /// The session was lost and the watch was re-armed on a new one.
    /// Always delivered before any event of the re-armed watch.
    Reconnected,
    /// The watch was terminated without firing.
    Removed {
        /// Why the watch ended.
        reason: RemovalReason,
    },
}

impl WatchNotification {
    /// Returns true if no further notification follows this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchNotification::Reconnected)
    }
}

struct WatchRecord {
    path: String,
    kind: WatchKind,
    namespace: Option<String>,
    tx: Sender<WatchNotification>,
    generation: u64,
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<u64, WatchRecord>,
    next_id: u64,
    session: Option<Arc<Session>>,
    closed: bool,
}

/// Registry of every outstanding watch.
#[derive(Default)]
pub struct WatchRegistry {
    inner: Mutex<RegistryInner>,
    forwarders: Arc<AtomicUsize>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding watches.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if no watch is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a raw watch obtained on `session`.
    ///
    /// `path` is the server-side path; events are reported relative to
    /// `namespace`. If `session` was already replaced, the watch is
    /// re-armed against the current session before this returns.
    pub(crate) fn register(
        self: &Arc<Self>,
        path: String,
        kind: WatchKind,
        namespace: Option<String>,
        raw: WatchReceiver,
        session: &Arc<Session>,
    ) -> Watcher {
        let (tx, rx) = mpsc::channel();
        let caller_path = strip_namespace(namespace.as_deref(), &path);

        let (id, current) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            if inner.closed {
                let _ = tx.send(WatchNotification::Removed {
                    reason: RemovalReason::ClientClosed,
                });
                return Watcher::new(id, caller_path, kind, rx, Weak::new());
            }

            inner.records.insert(
                id,
                WatchRecord {
                    path,
                    kind,
                    namespace,
                    tx,
                    generation: session.generation(),
                },
            );
            let current = inner
                .session
                .clone()
                .filter(|s| s.generation() > session.generation());
            (id, current)
        };

        match current {
            Some(current) => {
                debug!(id, "watch registered on a replaced session");
                self.mark_stale(id, session.generation());
                self.rearm(&current);
            }
            None => self.forward(id, session.generation(), raw),
        }

        Watcher::new(id, caller_path, kind, rx, Arc::downgrade(self))
    }

    /// Re-arms every record not armed on `session`.
    ///
    /// Called by the supervisor before a new session is published.
    pub(crate) fn rearm(self: &Arc<Self>, session: &Arc<Session>) {
        let generation = session.generation();
        let stale: Vec<(u64, String, WatchKind)> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.session = Some(Arc::clone(session));
            inner
                .records
                .iter()
                .filter(|(_, r)| r.generation != generation)
                .map(|(id, r)| (*id, r.path.clone(), r.kind))
                .collect()
        };

        if !stale.is_empty() {
            debug!(count = stale.len(), session = %session.id(), "re-arming watches");
        }

        for (id, path, kind) in stale {
            let result = arm(session.connection(), &path, kind);

            let mut inner = self.inner.lock();
            let Some(record) = inner.records.get_mut(&id) else {
                continue;
            };
            if record.generation == generation {
                continue;
            }

            match result {
                Ok(raw) => {
                    record.generation = generation;
                    if record.tx.send(WatchNotification::Reconnected).is_err() {
                        inner.records.remove(&id);
                        continue;
                    }
                    drop(inner);
                    debug!(id, %path, ?kind, "watch re-armed");
                    self.forward(id, generation, raw);
                }
                Err(err) if err.is_recoverable() => {
                    debug!(id, %path, %err, "watch re-arm deferred");
                }
                Err(err) => {
                    let reason = match err {
                        KeeperError::NoNode => RemovalReason::NodeGone,
                        other => RemovalReason::RearmFailed(other),
                    };
                    warn!(id, %path, %err, "watch removed");
                    if let Some(record) = inner.records.remove(&id) {
                        let _ = record.tx.send(WatchNotification::Removed { reason });
                    }
                }
            }
        }
    }

    /// Terminates every watch with `ClientClosed`.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.session = None;
        for (_, record) in inner.records.drain() {
            let _ = record.tx.send(WatchNotification::Removed {
                reason: RemovalReason::ClientClosed,
            });
        }
    }

    fn remove(&self, id: u64) {
        self.inner.lock().records.remove(&id);
    }

    fn contains(&self, id: u64) -> bool {
        self.inner.lock().records.contains_key(&id)
    }

    /// Returns true while record `id` still waits on a raw watch armed on
    /// `generation`.
    fn is_armed(&self, id: u64, generation: u64) -> bool {
        self.inner
            .lock()
            .records
            .get(&id)
            .is_some_and(|r| r.generation == generation)
    }

    /// Number of live forwarder threads.
    pub(crate) fn forwarders(&self) -> usize {
        self.forwarders.load(Ordering::SeqCst)
    }

    fn mark_stale(&self, id: u64, generation: u64) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            if record.generation == generation {
                record.generation = STALE;
            }
        }
    }

    /// Spawns the thread that waits on one raw watch.
    ///
    /// The thread exits once the raw watch yields, or once its record is
    /// cancelled, terminated or re-armed elsewhere.
    fn forward(self: &Arc<Self>, id: u64, generation: u64, raw: WatchReceiver) {
        let registry = Arc::downgrade(self);
        let live = Arc::clone(&self.forwarders);
        live.fetch_add(1, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("keeper-watch".into())
            .spawn(move || {
                loop {
                    let outcome = match raw.recv_timeout(FORWARD_POLL) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Disconnected) => None,
                        Err(RecvTimeoutError::Timeout) => {
                            match registry.upgrade() {
                                Some(registry) if registry.is_armed(id, generation) => continue,
                                _ => break,
                            }
                        }
                    };
                    if let Some(registry) = registry.upgrade() {
                        registry.deliver(id, generation, outcome);
                    }
                    break;
                }
                live.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(err) = spawned {
            warn!(id, %err, "failed to spawn watch forwarder");
            self.forwarders.fetch_sub(1, Ordering::SeqCst);
            self.mark_stale(id, generation);
        }
    }

    /// Applies the outcome of a raw watch armed on `generation`.
    fn deliver(&self, id: u64, generation: u64, event: Option<WatchedEvent>) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get_mut(&id) else {
            return;
        };
        if record.generation != generation {
            return;
        }

        match event {
            Some(event) if event.event_type != EventType::NotWatching => {
                if let Some(record) = inner.records.remove(&id) {
                    let path = strip_namespace(record.namespace.as_deref(), &event.path);
                    let _ = record
                        .tx
                        .send(WatchNotification::Event(WatchedEvent::new(event.event_type, path)));
                }
            }
            _ => {
                // The raw watch died with its connection.
                record.generation = STALE;
            }
        }
    }
}

fn arm(conn: &dyn RawConnection, path: &str, kind: WatchKind) -> KeeperResult<WatchReceiver> {
    match kind {
        WatchKind::Exists => conn.exists_w(path).map(|(_, rx)| rx),
        WatchKind::Data => conn.get_w(path).map(|(_, _, rx)| rx),
        WatchKind::Children => conn.children_w(path).map(|(_, _, rx)| rx),
    }
}

/// The caller's handle on one watch.
///
/// Dropping the handle cancels the watch.
pub struct Watcher {
    id: u64,
    path: String,
    kind: WatchKind,
    rx: Receiver<WatchNotification>,
    registry: Weak<WatchRegistry>,
}

impl Watcher {
    fn new(
        id: u64,
        path: String,
        kind: WatchKind,
        rx: Receiver<WatchNotification>,
        registry: Weak<WatchRegistry>,
    ) -> Self {
        Self {
            id,
            path,
            kind,
            rx,
            registry,
        }
    }

    /// Watched path, relative to the caller's namespace.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Kind of the watch.
    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// Returns true while the watch is outstanding.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }

    /// Blocks for the next notification. `None` once the watch has ended
    /// and every notification was consumed.
    pub fn recv(&self) -> Option<WatchNotification> {
        self.rx.recv().ok()
    }

    /// Like [`Watcher::recv`] with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WatchNotification> {
        match self.rx.recv_timeout(timeout) {
            Ok(n) => Some(n),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns a pending notification without blocking.
    pub fn try_recv(&self) -> Option<WatchNotification> {
        self.rx.try_recv().ok()
    }

    /// Cancels the watch.
    pub fn cancel(self) {}
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use crate::state::ConnectionStateManager;
    use keeper_proto::{SessionId, Stat};

    const WAIT: Duration = Duration::from_secs(2);

    fn session(
        manager: &ConnectionStateManager,
        conn: &Arc<MockConnection>,
        id: i64,
    ) -> Arc<Session> {
        let conn: Arc<dyn RawConnection> = Arc::clone(conn) as Arc<dyn RawConnection>;
        manager.new_session(SessionId(id), conn)
    }

    fn watch_on(
        registry: &Arc<WatchRegistry>,
        conn: &Arc<MockConnection>,
        session: &Arc<Session>,
        path: &str,
        kind: WatchKind,
    ) -> Watcher {
        conn.set_get_response(path, Ok((b"v".to_vec(), Stat::default())));
        let (_, _, raw) = conn.get_w(path).unwrap();
        registry.register(path.to_string(), kind, None, raw, session)
    }

    #[test]
    fn event_is_forwarded_once() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        registry.rearm(&s1);

        let watcher = watch_on(&registry, &conn, &s1, "/a", WatchKind::Data);
        assert_eq!(registry.len(), 1);

        assert_eq!(conn.fire_watch("/a", EventType::NodeDataChanged), 1);
        assert_eq!(
            watcher.recv_timeout(WAIT),
            Some(WatchNotification::Event(WatchedEvent::new(
                EventType::NodeDataChanged,
                "/a"
            )))
        );
        assert_eq!(watcher.recv_timeout(Duration::from_millis(50)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn rearm_on_new_session_sends_reconnected_first() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let old = Arc::new(MockConnection::new());
        let s1 = session(&manager, &old, 1);
        registry.rearm(&s1);
        let watcher = watch_on(&registry, &old, &s1, "/a", WatchKind::Data);

        old.close();

        let new = Arc::new(MockConnection::new());
        new.set_get_response("/a", Ok((b"v".to_vec(), Stat::default())));
        let s2 = session(&manager, &new, 2);
        registry.rearm(&s2);

        assert_eq!(watcher.recv_timeout(WAIT), Some(WatchNotification::Reconnected));
        assert!(watcher.is_active());

        new.fire_watch("/a", EventType::NodeDeleted);
        assert_eq!(
            watcher.recv_timeout(WAIT),
            Some(WatchNotification::Event(WatchedEvent::new(
                EventType::NodeDeleted,
                "/a"
            )))
        );
    }

    #[test]
    fn rearm_of_missing_node_removes_watch() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let old = Arc::new(MockConnection::new());
        let s1 = session(&manager, &old, 1);
        registry.rearm(&s1);
        let watcher = watch_on(&registry, &old, &s1, "/gone", WatchKind::Data);

        let new = Arc::new(MockConnection::new());
        new.set_get_response("/gone", Err(KeeperError::NoNode));
        registry.rearm(&session(&manager, &new, 2));

        assert_eq!(
            watcher.recv_timeout(WAIT),
            Some(WatchNotification::Removed {
                reason: RemovalReason::NodeGone
            })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn recoverable_rearm_failure_keeps_record() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let old = Arc::new(MockConnection::new());
        let s1 = session(&manager, &old, 1);
        registry.rearm(&s1);
        let watcher = watch_on(&registry, &old, &s1, "/a", WatchKind::Data);

        let flaky = Arc::new(MockConnection::new());
        flaky.push_failure(KeeperError::ConnectionLoss);
        registry.rearm(&session(&manager, &flaky, 2));
        assert_eq!(watcher.try_recv(), None);
        assert_eq!(registry.len(), 1);

        let good = Arc::new(MockConnection::new());
        good.set_get_response("/a", Ok((Vec::new(), Stat::default())));
        registry.rearm(&session(&manager, &good, 3));
        assert_eq!(watcher.recv_timeout(WAIT), Some(WatchNotification::Reconnected));
    }

    #[test]
    fn same_generation_is_not_rearmed() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        registry.rearm(&s1);
        let _watcher = watch_on(&registry, &conn, &s1, "/a", WatchKind::Data);

        let calls = conn.call_count("get_w");
        registry.rearm(&s1);
        assert_eq!(conn.call_count("get_w"), calls);
    }

    #[test]
    fn dropping_watcher_cancels() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        let watcher = watch_on(&registry, &conn, &s1, "/a", WatchKind::Children);
        assert_eq!(watcher.path(), "/a");
        assert_eq!(watcher.kind(), WatchKind::Children);

        watcher.cancel();
        assert!(registry.is_empty());
    }

    #[test]
    fn close_terminates_every_watch() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        let a = watch_on(&registry, &conn, &s1, "/a", WatchKind::Data);
        let b = watch_on(&registry, &conn, &s1, "/b", WatchKind::Exists);

        registry.close();
        let closed = Some(WatchNotification::Removed {
            reason: RemovalReason::ClientClosed,
        });
        assert_eq!(a.recv_timeout(WAIT), closed);
        assert_eq!(b.recv_timeout(WAIT), closed);
        assert!(!a.is_active());

        let late = watch_on(&registry, &conn, &s1, "/c", WatchKind::Data);
        assert_eq!(late.try_recv(), closed);
    }

    #[test]
    fn namespace_is_stripped_from_events() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        conn.set_get_response("/app/a", Ok((Vec::new(), Stat::default())));
        let (_, _, raw) = conn.get_w("/app/a").unwrap();
        let watcher = registry.register(
            "/app/a".into(),
            WatchKind::Data,
            Some("app".into()),
            raw,
            &s1,
        );
        assert_eq!(watcher.path(), "/a");

        conn.fire_watch("/app/a", EventType::NodeDataChanged);
        assert_eq!(
            watcher.recv_timeout(WAIT),
            Some(WatchNotification::Event(WatchedEvent::new(
                EventType::NodeDataChanged,
                "/a"
            )))
        );
    }

    #[test]
    fn registering_on_a_replaced_session_rearms_immediately() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let old = Arc::new(MockConnection::new());
        let new = Arc::new(MockConnection::new());
        new.set_get_response("/a", Ok((b"v".to_vec(), Stat::default())));
        let s1 = session(&manager, &old, 1);
        let s2 = session(&manager, &new, 2);
        registry.rearm(&s2);

        let watcher = watch_on(&registry, &old, &s1, "/a", WatchKind::Data);

        assert_eq!(watcher.recv_timeout(WAIT), Some(WatchNotification::Reconnected));
        assert_eq!(new.call_count("get_w"), 1);
        assert_eq!(registry.len(), 1);

        new.fire_watch("/a", EventType::NodeDataChanged);
        assert_eq!(
            watcher.recv_timeout(WAIT),
            Some(WatchNotification::Event(WatchedEvent::new(
                EventType::NodeDataChanged,
                "/a"
            )))
        );
    }

    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn cancelled_watches_release_their_forwarders() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let conn = Arc::new(MockConnection::new());
        let s1 = session(&manager, &conn, 1);
        registry.rearm(&s1);

        for i in 0..16 {
            let watcher = watch_on(&registry, &conn, &s1, &format!("/n{i}"), WatchKind::Data);
            watcher.cancel();
        }

        assert!(registry.is_empty());
        assert!(eventually(|| registry.forwarders() == 0));
        assert_eq!(conn.watch_count(), 16);
    }

    #[test]
    fn rearm_retires_the_old_forwarder() {
        let manager = ConnectionStateManager::new();
        let registry = Arc::new(WatchRegistry::new());
        let old = Arc::new(MockConnection::new());
        let s1 = session(&manager, &old, 1);
        registry.rearm(&s1);
        let _watcher = watch_on(&registry, &old, &s1, "/a", WatchKind::Data);
        assert_eq!(registry.forwarders(), 1);

        let new = Arc::new(MockConnection::new());
        new.set_get_response("/a", Ok((b"v".to_vec(), Stat::default())));
        registry.rearm(&session(&manager, &new, 2));

        assert!(eventually(|| registry.forwarders() == 1));
        thread::sleep(FORWARD_POLL * 2);
        assert_eq!(registry.forwarders(), 1);

        registry.close();
        assert!(eventually(|| registry.forwarders() == 0));
    }
}
