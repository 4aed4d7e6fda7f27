//! Connection state machine.
//!
//! The [`ConnectionStateManager`] holds the single authoritative
//! [`ConnectionState`] and the current [`Session`]. Only the supervisor
//! thread mutates it; everything else reads snapshots, blocks in
//! [`ConnectionStateManager::await_state`], or listens for [`StateEvent`]s.
//!
//! | From      | Raw event                 | To        |
//! |-----------|---------------------------|-----------|
//! | Latent    | connected                 | Connected |
//! | Connected | disconnected              | Suspended |
//! | Suspended | connected (same session)  | Connected |
//! | Suspended | expired / suspension cap  | Lost      |
//! | Lost      | connected (new session)   | Connected |
//!
//! The read-only flag is a qualifier and never changes the primary state.

use crate::connection::RawConnection;
use crate::context::CallContext;
use crate::error::{ClientError, ClientResult};
use keeper_proto::{SessionEvent, SessionId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How often blocked waiters re-check their cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// The high-level state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session has been established yet.
    Latent,
    /// A session is established and usable.
    Connected,
    /// The connection dropped; the session may still come back.
    Suspended,
    /// The session is gone for good.
    Lost,
}

impl ConnectionState {
    /// Returns true if operations can be issued right now.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Returns true if the state will resolve to `Connected` or `Lost`.
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectionState::Latent | ConnectionState::Suspended)
    }
}

/// An established session. Never reused: every new session is a new value.
pub struct Session {
    id: SessionId,
    generation: u64,
    connection: Arc<dyn RawConnection>,
    established: Instant,
}

impl Session {
    /// Identity assigned by the ensemble.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Local sequence number, increasing with every new session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The raw connection the session lives on.
    pub fn connection(&self) -> &dyn RawConnection {
        self.connection.as_ref()
    }

    /// Time since the session was established.
    pub fn age(&self) -> Duration {
        self.established.elapsed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// An immutable view of the manager at one instant.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// Primary state.
    pub state: ConnectionState,
    /// Read-only qualifier.
    pub read_only: bool,
    /// Current session, present exactly when `Connected` or `Suspended`.
    pub session: Option<Arc<Session>>,
    /// Number of events published so far.
    pub seq: u64,
}

/// A notification delivered to state listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// The primary state changed.
    Transition {
        /// Position in the total order of published events.
        seq: u64,
        /// State before the change.
        from: ConnectionState,
        /// State after the change.
        to: ConnectionState,
        /// Session live after the change.
        session_id: Option<SessionId>,
        /// Read-only qualifier after the change.
        read_only: bool,
    },
    /// Only the read-only qualifier changed.
    ReadOnlyChanged {
        /// Position in the total order of published events.
        seq: u64,
        /// New qualifier value.
        read_only: bool,
    },
}

/// One action the supervisor takes in response to a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Suspend,
    Resume { read_only: bool },
    Lose,
    Establish { session_id: SessionId, read_only: bool },
    ReadOnly(bool),
}

/// Maps a raw event onto the steps that apply it to the current state.
pub(crate) fn plan(
    state: ConnectionState,
    session: Option<SessionId>,
    read_only: bool,
    event: &SessionEvent,
) -> Vec<Step> {
    use ConnectionState::*;

    match event {
        SessionEvent::Connected {
            session_id,
            read_only: ro,
            ..
        } => {
            let establish = Step::Establish {
                session_id: *session_id,
                read_only: *ro,
            };
            match (state, session) {
                (Latent | Lost, _) | (_, None) => vec![establish],
                (Suspended, Some(current)) if current == *session_id => {
                    vec![Step::Resume { read_only: *ro }]
                }
                (Connected, Some(current)) if current == *session_id => {
                    if *ro != read_only {
                        vec![Step::ReadOnly(*ro)]
                    } else {
                        Vec::new()
                    }
                }
                (Connected | Suspended, Some(_)) => vec![Step::Lose, establish],
            }
        }
        SessionEvent::Disconnected => match state {
            Connected => vec![Step::Suspend],
            _ => Vec::new(),
        },
        SessionEvent::Expired | SessionEvent::AuthFailed => match state {
            Lost => Vec::new(),
            _ => vec![Step::Lose],
        },
    }
}

struct ManagerInner {
    state: ConnectionState,
    read_only: bool,
    session: Option<Arc<Session>>,
    seq: u64,
    lost_seq: u64,
    closed: bool,
    listeners: Vec<Sender<StateEvent>>,
    suspended_since: Option<Instant>,
    next_generation: u64,
}

impl ManagerInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            read_only: self.read_only,
            session: self.session.clone(),
            seq: self.seq,
        }
    }

    fn publish(&mut self, event: StateEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Owner of the authoritative connection state.
pub struct ConnectionStateManager {
    inner: Mutex<ManagerInner>,
    changed: Condvar,
}

impl ConnectionStateManager {
    /// Creates a manager in the `Latent` state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                state: ConnectionState::Latent,
                read_only: false,
                session: None,
                seq: 0,
                lost_seq: 0,
                closed: false,
                listeners: Vec::new(),
                suspended_since: None,
                next_generation: 1,
            }),
            changed: Condvar::new(),
        }
    }

    /// Non-blocking snapshot of the primary state.
    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Non-blocking snapshot of the whole manager.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().snapshot()
    }

    /// Returns true once the manager was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Registers a listener.
    ///
    /// The snapshot and the receiver are taken atomically: the receiver
    /// yields every event published after the snapshot, in order.
    pub fn subscribe(&self) -> (StateSnapshot, Receiver<StateEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.listeners.push(tx);
        }
        (inner.snapshot(), rx)
    }

    /// Blocks until `predicate` holds for the primary state.
    ///
    /// Fails with `DeadlineExceeded`/`Cancelled` per the context, and with
    /// `Closed` if the manager closes while waiting.
    pub fn await_state<F>(&self, predicate: F, ctx: &CallContext) -> ClientResult<StateSnapshot>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(ClientError::Closed);
            }
            if predicate(inner.state) {
                return Ok(inner.snapshot());
            }
            ctx.check()?;

            let poll = Instant::now() + CANCEL_POLL;
            let until = ctx.deadline().map_or(poll, |d| d.min(poll));
            self.changed.wait_until(&mut inner, until);
        }
    }

    /// Blocks while the state is pending.
    ///
    /// Fails with `ConnectionLost` if the session was lost at any point
    /// during the wait, even when a replacement is already connected.
    pub(crate) fn await_settled(&self, ctx: &CallContext) -> ClientResult<StateSnapshot> {
        let mut inner = self.inner.lock();
        let since = inner.seq;
        loop {
            if inner.closed {
                return Err(ClientError::Closed);
            }
            if inner.lost_seq > since {
                return Err(ClientError::ConnectionLost);
            }
            if !inner.state.is_pending() {
                return Ok(inner.snapshot());
            }
            ctx.check()?;

            let poll = Instant::now() + CANCEL_POLL;
            let until = ctx.deadline().map_or(poll, |d| d.min(poll));
            self.changed.wait_until(&mut inner, until);
        }
    }

    pub(crate) fn new_session(
        &self,
        id: SessionId,
        connection: Arc<dyn RawConnection>,
    ) -> Arc<Session> {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;
        Arc::new(Session {
            id,
            generation,
            connection,
            established: Instant::now(),
        })
    }

    /// Time spent in the current `Suspended` stretch, if suspended.
    pub(crate) fn suspended_for(&self) -> Option<Duration> {
        self.inner.lock().suspended_since.map(|t| t.elapsed())
    }

    pub(crate) fn suspend(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connected {
            inner.suspended_since = Some(Instant::now());
            self.transition(&mut inner, ConnectionState::Suspended);
        }
    }

    pub(crate) fn resume(&self, read_only: bool) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Suspended {
            inner.suspended_since = None;
            inner.read_only = read_only;
            self.transition(&mut inner, ConnectionState::Connected);
        }
    }

    /// Invalidates the session and moves to `Lost`. Waiters wake up and
    /// fail with `ConnectionLost`.
    pub(crate) fn lose(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Lost {
            inner.session = None;
            inner.read_only = false;
            inner.suspended_since = None;
            self.transition(&mut inner, ConnectionState::Lost);
            inner.lost_seq = inner.seq;
        }
    }

    pub(crate) fn establish(&self, session: Arc<Session>, read_only: bool) {
        let mut inner = self.inner.lock();
        inner.session = Some(session);
        inner.read_only = read_only;
        inner.suspended_since = None;
        self.transition(&mut inner, ConnectionState::Connected);
    }

    pub(crate) fn set_read_only(&self, read_only: bool) {
        let mut inner = self.inner.lock();
        if inner.read_only != read_only {
            inner.read_only = read_only;
            inner.seq += 1;
            let event = StateEvent::ReadOnlyChanged {
                seq: inner.seq,
                read_only,
            };
            debug!(read_only, "read-only qualifier changed");
            inner.publish(event);
            self.changed.notify_all();
        }
    }

    /// Marks the manager closed, drops every listener and wakes waiters.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.session = None;
        inner.listeners.clear();
        self.changed.notify_all();
    }

    fn transition(&self, inner: &mut ManagerInner, to: ConnectionState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.seq += 1;

        let session_id = inner.session.as_ref().map(|s| s.id());
        info!(
            ?from,
            ?to,
            session = ?session_id,
            read_only = inner.read_only,
            "connection state changed"
        );

        let event = StateEvent::Transition {
            seq: inner.seq,
            from,
            to,
            session_id,
            read_only: inner.read_only,
        };
        inner.publish(event);
        self.changed.notify_all();
    }
}

impl Default for ConnectionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use proptest::prelude::*;
    use std::thread;

    fn sid(id: i64) -> SessionId {
        SessionId(id)
    }

    /// Applies `events` to a manager the way the supervisor does and
    /// returns every published primary state.
    fn drive(events: &[SessionEvent]) -> Vec<ConnectionState> {
        let manager = ConnectionStateManager::new();
        let (_, rx) = manager.subscribe();
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());

        for event in events {
            let snap = manager.snapshot();
            let steps = plan(
                snap.state,
                snap.session.as_ref().map(|s| s.id()),
                snap.read_only,
                event,
            );
            for step in steps {
                match step {
                    Step::Suspend => manager.suspend(),
                    Step::Resume { read_only } => manager.resume(read_only),
                    Step::Lose => manager.lose(),
                    Step::Establish {
                        session_id,
                        read_only,
                    } => {
                        let session = manager.new_session(session_id, Arc::clone(&conn));
                        manager.establish(session, read_only);
                    }
                    Step::ReadOnly(ro) => manager.set_read_only(ro),
                }
            }
        }

        rx.try_iter()
            .filter_map(|e| match e {
                StateEvent::Transition { to, .. } => Some(to),
                StateEvent::ReadOnlyChanged { .. } => None,
            })
            .collect()
    }

    #[test]
    fn plan_table() {
        use ConnectionState::*;
        let connected = SessionEvent::connected(1);

        assert_eq!(
            plan(Latent, None, false, &connected),
            vec![Step::Establish {
                session_id: sid(1),
                read_only: false
            }]
        );
        assert_eq!(
            plan(Connected, Some(sid(1)), false, &SessionEvent::Disconnected),
            vec![Step::Suspend]
        );
        assert_eq!(
            plan(Suspended, Some(sid(1)), false, &connected),
            vec![Step::Resume { read_only: false }]
        );
        assert_eq!(
            plan(Suspended, Some(sid(1)), false, &SessionEvent::Expired),
            vec![Step::Lose]
        );
        assert_eq!(
            plan(Lost, None, false, &SessionEvent::connected(2)),
            vec![Step::Establish {
                session_id: sid(2),
                read_only: false
            }]
        );
    }

    #[test]
    fn plan_ignores_irrelevant_events() {
        use ConnectionState::*;
        assert!(plan(Latent, None, false, &SessionEvent::Disconnected).is_empty());
        assert!(plan(Suspended, Some(sid(1)), false, &SessionEvent::Disconnected).is_empty());
        assert!(plan(Lost, None, false, &SessionEvent::Expired).is_empty());
        assert!(plan(Connected, Some(sid(1)), false, &SessionEvent::connected(1)).is_empty());
    }

    #[test]
    fn plan_read_only_is_a_qualifier() {
        assert_eq!(
            plan(
                ConnectionState::Connected,
                Some(sid(1)),
                false,
                &SessionEvent::connected_read_only(1)
            ),
            vec![Step::ReadOnly(true)]
        );
    }

    #[test]
    fn plan_replaced_session_goes_through_lost() {
        assert_eq!(
            plan(
                ConnectionState::Suspended,
                Some(sid(1)),
                false,
                &SessionEvent::connected(9)
            ),
            vec![
                Step::Lose,
                Step::Establish {
                    session_id: sid(9),
                    read_only: false
                }
            ]
        );
    }

    #[test]
    fn full_lifecycle_transitions() {
        use ConnectionState::*;
        let states = drive(&[
            SessionEvent::connected(1),
            SessionEvent::Disconnected,
            SessionEvent::connected(1),
            SessionEvent::Disconnected,
            SessionEvent::Expired,
            SessionEvent::connected(2),
        ]);
        assert_eq!(
            states,
            vec![Connected, Suspended, Connected, Suspended, Lost, Connected]
        );
    }

    #[test]
    fn lose_invalidates_session() {
        let manager = ConnectionStateManager::new();
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        let session = manager.new_session(sid(4), conn);
        manager.establish(session, false);
        assert_eq!(manager.snapshot().session.unwrap().id(), sid(4));

        manager.lose();
        let snap = manager.snapshot();
        assert_eq!(snap.state, ConnectionState::Lost);
        assert!(snap.session.is_none());
    }

    #[test]
    fn sessions_get_fresh_generations() {
        let manager = ConnectionStateManager::new();
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        let a = manager.new_session(sid(1), Arc::clone(&conn));
        let b = manager.new_session(sid(1), conn);
        assert!(b.generation() > a.generation());
    }

    #[test]
    fn subscribe_sees_state_at_registration() {
        let manager = ConnectionStateManager::new();
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        manager.establish(manager.new_session(sid(1), conn), false);

        let (snap, rx) = manager.subscribe();
        assert_eq!(snap.state, ConnectionState::Connected);

        manager.suspend();
        match rx.try_recv().unwrap() {
            StateEvent::Transition { seq, from, to, .. } => {
                assert_eq!(seq, snap.seq + 1);
                assert_eq!(from, ConnectionState::Connected);
                assert_eq!(to, ConnectionState::Suspended);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn read_only_changes_are_published_separately() {
        let manager = ConnectionStateManager::new();
        let (_, rx) = manager.subscribe();
        manager.set_read_only(true);
        manager.set_read_only(true);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![StateEvent::ReadOnlyChanged {
                seq: 1,
                read_only: true
            }]
        );
        assert_eq!(manager.current_state(), ConnectionState::Latent);
    }

    #[test]
    fn await_state_wakes_on_transition() {
        let manager = Arc::new(ConnectionStateManager::new());
        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.await_state(
                    |s| s.is_connected(),
                    &CallContext::with_timeout(Duration::from_secs(5)),
                )
            })
        };

        thread::sleep(Duration::from_millis(20));
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        manager.establish(manager.new_session(sid(3), conn), false);

        let snap = waiter.join().unwrap().unwrap();
        assert_eq!(snap.state, ConnectionState::Connected);
    }

    #[test]
    fn await_state_deadline() {
        let manager = ConnectionStateManager::new();
        let result = manager.await_state(
            |s| s.is_connected(),
            &CallContext::with_timeout(Duration::from_millis(30)),
        );
        assert!(matches!(result, Err(ClientError::DeadlineExceeded)));
    }

    #[test]
    fn await_state_fails_when_closed() {
        let manager = Arc::new(ConnectionStateManager::new());
        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.await_state(|s| s.is_connected(), &CallContext::background())
            })
        };
        thread::sleep(Duration::from_millis(20));
        manager.close();
        assert!(matches!(waiter.join().unwrap(), Err(ClientError::Closed)));
    }

    #[test]
    fn await_settled_fails_on_loss_even_if_replaced() {
        let manager = Arc::new(ConnectionStateManager::new());
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        manager.establish(manager.new_session(sid(1), Arc::clone(&conn)), false);
        manager.suspend();

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.await_settled(&CallContext::with_timeout(Duration::from_secs(5)))
            })
        };
        thread::sleep(Duration::from_millis(20));
        manager.lose();
        manager.establish(manager.new_session(sid(2), conn), false);

        assert!(matches!(
            waiter.join().unwrap(),
            Err(ClientError::ConnectionLost)
        ));
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[test]
    fn await_settled_returns_on_resume() {
        let manager = Arc::new(ConnectionStateManager::new());
        let conn: Arc<dyn RawConnection> = Arc::new(MockConnection::new());
        manager.establish(manager.new_session(sid(1), conn), false);
        manager.suspend();

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.await_settled(&CallContext::with_timeout(Duration::from_secs(5)))
            })
        };
        thread::sleep(Duration::from_millis(20));
        manager.resume(false);

        let snap = waiter.join().unwrap().unwrap();
        assert_eq!(snap.state, ConnectionState::Connected);
        assert_eq!(snap.session.unwrap().id(), sid(1));
    }

    fn event_strategy() -> impl Strategy<Value = SessionEvent> {
        prop_oneof![
            (1i64..4).prop_map(SessionEvent::connected),
            (1i64..4).prop_map(SessionEvent::connected_read_only),
            Just(SessionEvent::Disconnected),
            Just(SessionEvent::Expired),
            Just(SessionEvent::AuthFailed),
        ]
    }

    proptest! {
        #[test]
        fn never_repeats_a_state(events in prop::collection::vec(event_strategy(), 0..40)) {
            let states = drive(&events);
            for pair in states.windows(2) {
                prop_assert_ne!(pair[0], pair[1]);
            }
        }

        #[test]
        fn suspended_resolves_to_connected_or_lost(events in prop::collection::vec(event_strategy(), 0..40)) {
            let states = drive(&events);
            for pair in states.windows(2) {
                if pair[0] == ConnectionState::Suspended {
                    prop_assert!(matches!(pair[1], ConnectionState::Connected | ConnectionState::Lost));
                }
            }
        }
    }
}
