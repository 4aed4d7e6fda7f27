//! In-memory ensemble.
//!
//! [`InMemoryEnsemble`] implements [`Dialer`] over a single in-process tree
//! with real node semantics: versions, ephemeral and sequential nodes,
//! ACLs, atomic multi, one-shot watches scoped to their session, and
//! session expiry that removes ephemerals. Fault injection covers the
//! events a real ensemble produces: disconnects, same-session reconnects,
//! expiry, failed calls and failed dials.

use keeper_client::{Dialed, Dialer, RawConnection, WatchReceiver};
use keeper_proto::path::{self, node_name};
use keeper_proto::{
    Acl, CreateMode, EventType, KeeperError, KeeperResult, Op, OpResult, SessionEvent, SessionId,
    Stat, WatchedEvent, ANY_VERSION,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type Fired = Vec<(String, EventType)>;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

/// The node tree. Cloned to roll back a failed multi.
#[derive(Debug, Clone)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                acl: Acl::open_unsafe(),
                stat: Stat::default(),
            },
        );
        Self { nodes, zxid: 0 }
    }

    fn tick(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn node(&self, path: &str) -> KeeperResult<&Node> {
        self.nodes.get(path).ok_or(KeeperError::NoNode)
    }

    fn node_mut(&mut self, path: &str) -> KeeperResult<&mut Node> {
        self.nodes.get_mut(path).ok_or(KeeperError::NoNode)
    }

    fn check_version(expected: i32, actual: i32) -> KeeperResult<()> {
        if expected != ANY_VERSION && expected != actual {
            return Err(KeeperError::BadVersion);
        }
        Ok(())
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: &[Acl],
        owner: i64,
        fired: &mut Fired,
    ) -> KeeperResult<String> {
        let parent_path = path::parent(path).ok_or(KeeperError::NodeExists)?;
        if acl.is_empty() {
            return Err(KeeperError::InvalidAcl);
        }
        let parent = self.node(parent_path)?;
        if parent.stat.ephemeral_owner != 0 {
            return Err(KeeperError::NoChildrenForEphemerals);
        }

        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(KeeperError::NodeExists);
        }

        let zxid = self.tick();
        let now = now_millis();
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                acl: acl.to_vec(),
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    ctime: now,
                    mtime: now,
                    ephemeral_owner: if mode.is_ephemeral() { owner } else { 0 },
                    data_length: data.len() as i32,
                    pzxid: zxid,
                    ..Stat::default()
                },
            },
        );

        let parent = self.node_mut(parent_path)?;
        parent.stat.cversion += 1;
        parent.stat.num_children += 1;
        parent.stat.pzxid = zxid;

        fired.push((actual.clone(), EventType::NodeCreated));
        fired.push((parent_path.to_string(), EventType::NodeChildrenChanged));
        Ok(actual)
    }

    fn set(&mut self, path: &str, data: &[u8], version: i32, fired: &mut Fired) -> KeeperResult<Stat> {
        let zxid = self.zxid + 1;
        let node = self.node_mut(path)?;
        Self::check_version(version, node.stat.version)?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = now_millis();
        node.stat.data_length = data.len() as i32;
        let stat = node.stat;
        self.zxid = zxid;
        fired.push((path.to_string(), EventType::NodeDataChanged));
        Ok(stat)
    }

    fn delete(&mut self, path: &str, version: i32, fired: &mut Fired) -> KeeperResult<()> {
        let parent_path = path::parent(path).ok_or(KeeperError::BadArguments)?;
        let node = self.node(path)?;
        Self::check_version(version, node.stat.version)?;
        if node.stat.num_children > 0 {
            return Err(KeeperError::NotEmpty);
        }

        self.nodes.remove(path);
        let zxid = self.tick();
        let parent = self.node_mut(parent_path)?;
        parent.stat.cversion += 1;
        parent.stat.num_children -= 1;
        parent.stat.pzxid = zxid;

        fired.push((path.to_string(), EventType::NodeDeleted));
        fired.push((parent_path.to_string(), EventType::NodeChildrenChanged));
        Ok(())
    }

    fn check(&self, path: &str, version: i32) -> KeeperResult<()> {
        Self::check_version(version, self.node(path)?.stat.version)
    }

    fn children(&self, path: &str) -> KeeperResult<(Vec<String>, Stat)> {
        let stat = self.node(path)?.stat;
        let children = self
            .nodes
            .keys()
            .filter(|k| k.as_str() != "/" && path::parent(k) == Some(path))
            .map(|k| node_name(k).to_string())
            .collect();
        Ok((children, stat))
    }

    fn set_acl(&mut self, path: &str, acl: &[Acl], version: i32) -> KeeperResult<Stat> {
        if acl.is_empty() {
            return Err(KeeperError::InvalidAcl);
        }
        let node = self.node_mut(path)?;
        Self::check_version(version, node.stat.aversion)?;
        node.acl = acl.to_vec();
        node.stat.aversion += 1;
        Ok(node.stat)
    }

    fn apply(&mut self, op: &Op, owner: i64, fired: &mut Fired) -> KeeperResult<OpResult> {
        match op {
            Op::Create {
                path,
                data,
                acl,
                mode,
            } => Ok(OpResult::Create {
                path: self.create(path, data, *mode, acl, owner, fired)?,
            }),
            Op::Delete { path, version } => {
                self.delete(path, *version, fired)?;
                Ok(OpResult::Delete)
            }
            Op::SetData {
                path,
                data,
                version,
            } => Ok(OpResult::SetData {
                stat: self.set(path, data, *version, fired)?,
            }),
            Op::Check { path, version } => {
                self.check(path, *version)?;
                Ok(OpResult::Check)
            }
        }
    }

    fn ephemerals_of(&self, session: i64) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawWatchKind {
    Exists,
    Data,
    Children,
}

impl RawWatchKind {
    fn triggered_by(self, event_type: EventType) -> bool {
        use EventType::*;
        match self {
            RawWatchKind::Exists => matches!(event_type, NodeCreated | NodeDataChanged | NodeDeleted),
            RawWatchKind::Data => matches!(event_type, NodeDataChanged | NodeDeleted),
            RawWatchKind::Children => matches!(event_type, NodeChildrenChanged | NodeDeleted),
        }
    }
}

struct RawWatch {
    session: i64,
    path: String,
    kind: RawWatchKind,
    tx: Sender<WatchedEvent>,
}

struct SessionEntry {
    events: Sender<SessionEvent>,
    connected: bool,
    timeout: Duration,
    auth: Vec<(String, Vec<u8>)>,
}

struct EnsembleState {
    tree: Tree,
    sessions: HashMap<i64, SessionEntry>,
    watches: Vec<RawWatch>,
    next_session: i64,
    failures: VecDeque<KeeperError>,
    dial_failures: VecDeque<KeeperError>,
    read_only: bool,
    reachable: bool,
    calls: u64,
    connect_strings: Vec<String>,
}

impl EnsembleState {
    fn fire(&mut self, fired: Fired) {
        for (path, event_type) in fired {
            self.watches.retain(|w| {
                let hit = w.path == path && w.kind.triggered_by(event_type);
                if hit {
                    let _ = w.tx.send(WatchedEvent::new(event_type, path.clone()));
                }
                !hit
            });
        }
    }

    fn watch(&mut self, session: i64, path: &str, kind: RawWatchKind) -> WatchReceiver {
        let (tx, rx) = mpsc::channel();
        self.watches.push(RawWatch {
            session,
            path: path.to_string(),
            kind,
            tx,
        });
        rx
    }

    /// Ends a session: drops its watches and removes its ephemerals.
    fn end_session(&mut self, id: i64) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&id)?;
        self.watches.retain(|w| w.session != id);

        let mut fired = Vec::new();
        for node in self.tree.ephemerals_of(id) {
            let _ = self.tree.delete(&node, ANY_VERSION, &mut fired);
        }
        self.fire(fired);
        Some(entry)
    }

    fn connected_event(&self, id: i64, timeout: Duration) -> SessionEvent {
        SessionEvent::Connected {
            session_id: SessionId(id),
            read_only: self.read_only,
            negotiated_timeout: timeout,
        }
    }
}

/// An in-process ensemble with fault injection.
///
/// Cloning is cheap; clones share the same tree and sessions.
#[derive(Clone)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl InMemoryEnsemble {
    /// Creates an ensemble holding only the root node.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                tree: Tree::new(),
                sessions: HashMap::new(),
                watches: Vec::new(),
                next_session: 0x100,
                failures: VecDeque::new(),
                dial_failures: VecDeque::new(),
                read_only: false,
                reachable: true,
                calls: 0,
                connect_strings: Vec::new(),
            })),
        }
    }

    // Fault injection

    /// Drops the connection of a session. The session stays alive.
    pub fn disconnect(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session.0) {
            entry.connected = false;
            let _ = entry.events.send(SessionEvent::Disconnected);
            debug!(%session, "ensemble: disconnected");
        }
    }

    /// Restores the connection of a disconnected session.
    pub fn reconnect(&self, session: SessionId) {
        let mut state = self.state.lock();
        let read_only = state.read_only;
        if let Some(entry) = state.sessions.get_mut(&session.0) {
            entry.connected = true;
            let _ = entry.events.send(SessionEvent::Connected {
                session_id: session,
                read_only,
                negotiated_timeout: entry.timeout,
            });
            debug!(%session, "ensemble: reconnected");
        }
    }

    /// Expires a session: its watches are dropped, its ephemerals removed.
    pub fn expire_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.end_session(session.0) {
            let _ = entry.events.send(SessionEvent::Expired);
            debug!(%session, "ensemble: expired");
        }
    }

    /// Makes the next `n` raw calls fail with `err`, whatever session.
    pub fn fail_next(&self, err: KeeperError, n: usize) {
        self.state
            .lock()
            .failures
            .extend(std::iter::repeat(err).take(n));
    }

    /// Makes the next `n` dials fail with `err`.
    pub fn fail_next_dials(&self, err: KeeperError, n: usize) {
        self.state
            .lock()
            .dial_failures
            .extend(std::iter::repeat(err).take(n));
    }

    /// Makes every dial fail with `ConnectionLoss` until reachable again.
    /// Existing sessions are unaffected.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Switches every server to read-only (or back) and tells every
    /// connected session.
    pub fn set_read_only(&self, read_only: bool) {
        let mut state = self.state.lock();
        state.read_only = read_only;
        let updates: Vec<_> = state
            .sessions
            .iter()
            .filter(|(_, e)| e.connected)
            .map(|(id, e)| (e.events.clone(), state.connected_event(*id, e.timeout)))
            .collect();
        for (events, event) in updates {
            let _ = events.send(event);
        }
    }

    // Introspection

    /// Sessions that have not expired or been closed.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.state.lock().sessions.keys().map(|id| SessionId(*id)).collect();
        ids.sort();
        ids
    }

    /// The most recently created live session.
    pub fn latest_session(&self) -> Option<SessionId> {
        self.live_sessions().pop()
    }

    /// Raw calls received so far, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    /// Dials received so far, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.state.lock().connect_strings.len()
    }

    /// Connect strings of every dial so far.
    pub fn connect_strings(&self) -> Vec<String> {
        self.state.lock().connect_strings.clone()
    }

    /// Outstanding raw watches.
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Credentials a session added.
    pub fn session_auth(&self, session: SessionId) -> Vec<(String, Vec<u8>)> {
        self.state
            .lock()
            .sessions
            .get(&session.0)
            .map(|e| e.auth.clone())
            .unwrap_or_default()
    }

    // Direct tree access, as another client would see it

    /// Data of a node.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().tree.nodes.get(path).map(|n| n.data.clone())
    }

    /// Metadata of a node.
    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.state.lock().tree.nodes.get(path).map(|n| n.stat)
    }

    /// ACL of a node.
    pub fn acl(&self, path: &str) -> Option<Vec<Acl>> {
        self.state.lock().tree.nodes.get(path).map(|n| n.acl.clone())
    }

    /// Sorted child names of a node.
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .tree
            .children(path)
            .map(|(c, _)| c)
            .unwrap_or_default()
    }

    /// Creates or overwrites a node, creating parents, firing watches.
    pub fn put(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let mut fired = Vec::new();
        for ancestor in path::ancestors(path) {
            let _ = state.tree.create(
                &ancestor,
                &[],
                CreateMode::Persistent,
                &Acl::open_unsafe(),
                0,
                &mut fired,
            );
        }
        if state.tree.set(path, data, ANY_VERSION, &mut fired).is_err() {
            let _ = state.tree.create(
                path,
                data,
                CreateMode::Persistent,
                &Acl::open_unsafe(),
                0,
                &mut fired,
            );
        }
        state.fire(fired);
    }

    /// Deletes a leaf node, firing watches.
    pub fn remove(&self, path: &str) -> KeeperResult<()> {
        let mut state = self.state.lock();
        let mut fired = Vec::new();
        state.tree.delete(path, ANY_VERSION, &mut fired)?;
        state.fire(fired);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryEnsemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryEnsemble")
            .field("nodes", &state.tree.nodes.len())
            .field("sessions", &state.sessions.len())
            .field("watches", &state.watches.len())
            .field("read_only", &state.read_only)
            .finish()
    }
}

impl Default for InMemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for InMemoryEnsemble {
    fn dial(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        can_be_read_only: bool,
    ) -> KeeperResult<Dialed> {
        let mut state = self.state.lock();
        state.connect_strings.push(connect_string.to_string());
        if let Some(err) = state.dial_failures.pop_front() {
            return Err(err);
        }
        if !state.reachable || (state.read_only && !can_be_read_only) {
            return Err(KeeperError::ConnectionLoss);
        }

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(state.connected_event(id, session_timeout));
        state.sessions.insert(
            id,
            SessionEntry {
                events: tx,
                connected: true,
                timeout: session_timeout,
                auth: Vec::new(),
            },
        );
        debug!(session = %SessionId(id), connect_string, "ensemble: dialed");

        Ok(Dialed {
            connection: Arc::new(EnsembleConnection {
                state: Arc::clone(&self.state),
                session: id,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

/// A raw connection bound to one session of an [`InMemoryEnsemble`].
pub struct EnsembleConnection {
    state: Arc<Mutex<EnsembleState>>,
    session: i64,
    closed: AtomicBool,
}

impl EnsembleConnection {
    /// Session this connection belongs to.
    pub fn session_id(&self) -> SessionId {
        SessionId(self.session)
    }

    /// Runs `f` against the tree once the connection checks pass.
    fn with_state<T>(
        &self,
        write: bool,
        f: impl FnOnce(&mut EnsembleState, i64) -> KeeperResult<T>,
    ) -> KeeperResult<T> {
        let mut state = self.state.lock();
        state.calls += 1;
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeeperError::ConnectionLoss);
        }
        match state.sessions.get(&self.session) {
            None => return Err(KeeperError::SessionExpired),
            Some(entry) if !entry.connected => return Err(KeeperError::ConnectionLoss),
            Some(_) => {}
        }
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if write && state.read_only {
            return Err(KeeperError::NotReadOnly);
        }
        f(&mut *state, self.session)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tree, i64, &mut Fired) -> KeeperResult<T>) -> KeeperResult<T> {
        self.with_state(true, |state, session| {
            let mut fired = Vec::new();
            let out = f(&mut state.tree, session, &mut fired)?;
            state.fire(fired);
            Ok(out)
        })
    }
}

impl RawConnection for EnsembleConnection {
    fn add_auth(&self, scheme: &str, auth: &[u8]) -> KeeperResult<()> {
        self.with_state(false, |state, session| {
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.auth.push((scheme.to_string(), auth.to_vec()));
            }
            Ok(())
        })
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode, acl: &[Acl]) -> KeeperResult<String> {
        self.mutate(|tree, session, fired| tree.create(path, data, mode, acl, session, fired))
    }

    fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        self.with_state(false, |state, _| Ok(state.tree.nodes.get(path).map(|n| n.stat)))
    }

    fn exists_w(&self, path: &str) -> KeeperResult<(Option<Stat>, WatchReceiver)> {
        self.with_state(false, |state, session| {
            let stat = state.tree.nodes.get(path).map(|n| n.stat);
            Ok((stat, state.watch(session, path, RawWatchKind::Exists)))
        })
    }

    fn get(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        self.with_state(false, |state, _| {
            let node = state.tree.node(path)?;
            Ok((node.data.clone(), node.stat))
        })
    }

    fn get_w(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat, WatchReceiver)> {
        self.with_state(false, |state, session| {
            let node = state.tree.node(path)?;
            let (data, stat) = (node.data.clone(), node.stat);
            Ok((data, stat, state.watch(session, path, RawWatchKind::Data)))
        })
    }

    fn set(&self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat> {
        self.mutate(|tree, _, fired| tree.set(path, data, version, fired))
    }

    fn delete(&self, path: &str, version: i32) -> KeeperResult<()> {
        self.mutate(|tree, _, fired| tree.delete(path, version, fired))
    }

    fn children(&self, path: &str) -> KeeperResult<(Vec<String>, Stat)> {
        self.with_state(false, |state, _| state.tree.children(path))
    }

    fn children_w(&self, path: &str) -> KeeperResult<(Vec<String>, Stat, WatchReceiver)> {
        self.with_state(false, |state, session| {
            let (children, stat) = state.tree.children(path)?;
            Ok((children, stat, state.watch(session, path, RawWatchKind::Children)))
        })
    }

    fn get_acl(&self, path: &str) -> KeeperResult<(Vec<Acl>, Stat)> {
        self.with_state(false, |state, _| {
            let node = state.tree.node(path)?;
            Ok((node.acl.clone(), node.stat))
        })
    }

    fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> KeeperResult<Stat> {
        self.mutate(|tree, _, _| tree.set_acl(path, acl, version))
    }

    fn multi(&self, ops: &[Op]) -> KeeperResult<Vec<OpResult>> {
        self.with_state(true, |state, session| {
            let snapshot = state.tree.clone();
            let mut fired = Vec::new();
            let mut results = Vec::with_capacity(ops.len());

            for (idx, op) in ops.iter().enumerate() {
                match state.tree.apply(op, session, &mut fired) {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        state.tree = snapshot;
                        return Ok((0..ops.len())
                            .map(|i| {
                                OpResult::Error(if i == idx {
                                    err
                                } else {
                                    KeeperError::RuntimeInconsistency
                                })
                            })
                            .collect());
                    }
                }
            }

            state.fire(fired);
            Ok(results)
        })
    }

    fn sync(&self, path: &str) -> KeeperResult<String> {
        self.with_state(false, |_, _| Ok(path.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if state.end_session(self.session).is_some() {
            debug!(session = %SessionId(self.session), "ensemble: session closed");
        }
    }
}
