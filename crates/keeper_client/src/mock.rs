//! Scriptable raw driver for tests.
//!
//! [`MockConnection`] answers each raw call from canned responses and
//! records every call it receives. Queued failures are returned before any
//! canned response, one per call, which makes retry budgets easy to script.
//! [`MockDialer`] hands out queued connections in order.

use crate::connection::{Dialed, Dialer, RawConnection, WatchReceiver};
use keeper_proto::{
    Acl, CreateMode, EventType, KeeperError, KeeperResult, Op, OpResult, SessionEvent, Stat,
    WatchedEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// One raw call received by a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Raw operation name (`create`, `get_w`, ...).
    pub op: &'static str,
    /// Path argument; empty for `multi`.
    pub path: String,
    /// Payload, for `create` and `set`.
    pub data: Option<Vec<u8>>,
    /// ACL, for `create` and `set_acl`.
    pub acl: Vec<Acl>,
}

impl MockCall {
    fn new(op: &'static str, path: &str) -> Self {
        Self {
            op,
            path: path.to_string(),
            data: None,
            acl: Vec::new(),
        }
    }
}

/// A mock raw connection.
///
/// Without a canned response, `create` and `sync` echo the path, `exists`
/// reports no node, writes succeed with a default [`Stat`], `multi`
/// succeeds for every op, and `get`/`children`/`get_acl` fail with
/// `Unimplemented`.
#[derive(Debug, Default)]
pub struct MockConnection {
    closed: AtomicBool,
    failures: Mutex<VecDeque<KeeperError>>,
    calls: Mutex<Vec<MockCall>>,
    auth: Mutex<Vec<(String, Vec<u8>)>>,
    watches: Mutex<Vec<(String, Sender<WatchedEvent>)>>,
    create_response: Mutex<Option<KeeperResult<String>>>,
    set_response: Mutex<Option<KeeperResult<Stat>>>,
    delete_response: Mutex<Option<KeeperResult<()>>>,
    multi_response: Mutex<Option<KeeperResult<Vec<OpResult>>>>,
    exists_responses: Mutex<HashMap<String, KeeperResult<Option<Stat>>>>,
    get_responses: Mutex<HashMap<String, KeeperResult<(Vec<u8>, Stat)>>>,
    children_responses: Mutex<HashMap<String, KeeperResult<(Vec<String>, Stat)>>>,
    acl_responses: Mutex<HashMap<String, KeeperResult<(Vec<Acl>, Stat)>>>,
}

impl MockConnection {
    /// Creates a new open mock connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure returned by the next call, whatever it is.
    pub fn push_failure(&self, err: KeeperError) {
        self.failures.lock().push_back(err);
    }

    /// Queues `n` copies of a failure.
    pub fn push_failures(&self, err: KeeperError, n: usize) {
        self.failures.lock().extend(std::iter::repeat(err).take(n));
    }

    /// Sets the create response.
    pub fn set_create_response(&self, response: KeeperResult<String>) {
        *self.create_response.lock() = Some(response);
    }

    /// Sets the set-data response.
    pub fn set_set_response(&self, response: KeeperResult<Stat>) {
        *self.set_response.lock() = Some(response);
    }

    /// Sets the delete response.
    pub fn set_delete_response(&self, response: KeeperResult<()>) {
        *self.delete_response.lock() = Some(response);
    }

    /// Sets the multi response.
    pub fn set_multi_response(&self, response: KeeperResult<Vec<OpResult>>) {
        *self.multi_response.lock() = Some(response);
    }

    /// Sets the exists response for `path`.
    pub fn set_exists_response(&self, path: &str, response: KeeperResult<Option<Stat>>) {
        self.exists_responses.lock().insert(path.to_string(), response);
    }

    /// Sets the get response for `path`.
    pub fn set_get_response(&self, path: &str, response: KeeperResult<(Vec<u8>, Stat)>) {
        self.get_responses.lock().insert(path.to_string(), response);
    }

    /// Sets the children response for `path`.
    pub fn set_children_response(&self, path: &str, response: KeeperResult<(Vec<String>, Stat)>) {
        self.children_responses
            .lock()
            .insert(path.to_string(), response);
    }

    /// Sets the get-ACL response for `path`.
    pub fn set_acl_response(&self, path: &str, response: KeeperResult<(Vec<Acl>, Stat)>) {
        self.acl_responses.lock().insert(path.to_string(), response);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of one raw operation.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// Total number of raw calls, `add_auth` excluded.
    pub fn attempts(&self) -> usize {
        self.calls.lock().len()
    }

    /// Credentials added with `add_auth`.
    pub fn auth_entries(&self) -> Vec<(String, Vec<u8>)> {
        self.auth.lock().clone()
    }

    /// Number of outstanding raw watches.
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Fires every watch on `path` and returns how many fired.
    pub fn fire_watch(&self, path: &str, event_type: EventType) -> usize {
        let mut watches = self.watches.lock();
        let mut fired = 0;
        watches.retain(|(watched, tx)| {
            if watched != path {
                return true;
            }
            if tx.send(WatchedEvent::new(event_type, path)).is_ok() {
                fired += 1;
            }
            false
        });
        fired
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self, call: MockCall) -> KeeperResult<()> {
        self.calls.lock().push(call);
        if self.is_closed() {
            return Err(KeeperError::ConnectionLoss);
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn watch(&self, path: &str) -> WatchReceiver {
        let (tx, rx) = mpsc::channel();
        self.watches.lock().push((path.to_string(), tx));
        rx
    }

    fn canned<T: Clone>(map: &Mutex<HashMap<String, KeeperResult<T>>>, path: &str) -> Option<KeeperResult<T>> {
        map.lock().get(path).cloned()
    }
}

impl RawConnection for MockConnection {
    fn add_auth(&self, scheme: &str, auth: &[u8]) -> KeeperResult<()> {
        if self.is_closed() {
            return Err(KeeperError::ConnectionLoss);
        }
        self.auth.lock().push((scheme.to_string(), auth.to_vec()));
        Ok(())
    }

    fn create(&self, path: &str, data: &[u8], _mode: CreateMode, acl: &[Acl]) -> KeeperResult<String> {
        let mut call = MockCall::new("create", path);
        call.data = Some(data.to_vec());
        call.acl = acl.to_vec();
        self.begin(call)?;
        self.create_response
            .lock()
            .clone()
            .unwrap_or_else(|| Ok(path.to_string()))
    }

    fn exists(&self, path: &str) -> KeeperResult<Option<Stat>> {
        self.begin(MockCall::new("exists", path))?;
        Self::canned(&self.exists_responses, path).unwrap_or(Ok(None))
    }

    fn exists_w(&self, path: &str) -> KeeperResult<(Option<Stat>, WatchReceiver)> {
        self.begin(MockCall::new("exists_w", path))?;
        let stat = Self::canned(&self.exists_responses, path).unwrap_or(Ok(None))?;
        Ok((stat, self.watch(path)))
    }

    fn get(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        self.begin(MockCall::new("get", path))?;
        Self::canned(&self.get_responses, path).unwrap_or(Err(KeeperError::Unimplemented))
    }

    fn get_w(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat, WatchReceiver)> {
        self.begin(MockCall::new("get_w", path))?;
        let (data, stat) =
            Self::canned(&self.get_responses, path).unwrap_or(Err(KeeperError::Unimplemented))?;
        Ok((data, stat, self.watch(path)))
    }

    fn set(&self, path: &str, data: &[u8], _version: i32) -> KeeperResult<Stat> {
        let mut call = MockCall::new("set", path);
        call.data = Some(data.to_vec());
        self.begin(call)?;
        self.set_response
            .lock()
            .clone()
            .unwrap_or_else(|| Ok(Stat::default()))
    }

    fn delete(&self, path: &str, _version: i32) -> KeeperResult<()> {
        self.begin(MockCall::new("delete", path))?;
        self.delete_response.lock().clone().unwrap_or(Ok(()))
    }

    fn children(&self, path: &str) -> KeeperResult<(Vec<String>, Stat)> {
        self.begin(MockCall::new("children", path))?;
        Self::canned(&self.children_responses, path).unwrap_or(Err(KeeperError::Unimplemented))
    }

    fn children_w(&self, path: &str) -> KeeperResult<(Vec<String>, Stat, WatchReceiver)> {
        self.begin(MockCall::new("children_w", path))?;
        let (children, stat) = Self::canned(&self.children_responses, path)
            .unwrap_or(Err(KeeperError::Unimplemented))?;
        Ok((children, stat, self.watch(path)))
    }

    fn get_acl(&self, path: &str) -> KeeperResult<(Vec<Acl>, Stat)> {
        self.begin(MockCall::new("get_acl", path))?;
        Self::canned(&self.acl_responses, path).unwrap_or(Err(KeeperError::Unimplemented))
    }

    fn set_acl(&self, path: &str, acl: &[Acl], _version: i32) -> KeeperResult<Stat> {
        let mut call = MockCall::new("set_acl", path);
        call.acl = acl.to_vec();
        self.begin(call)?;
        Ok(Stat::default())
    }

    fn multi(&self, ops: &[Op]) -> KeeperResult<Vec<OpResult>> {
        self.begin(MockCall::new("multi", ""))?;
        if let Some(response) = self.multi_response.lock().clone() {
            return response;
        }
        Ok(ops
            .iter()
            .map(|op| match op {
                Op::Create { path, .. } => OpResult::Create { path: path.clone() },
                Op::Delete { .. } => OpResult::Delete,
                Op::SetData { .. } => OpResult::SetData {
                    stat: Stat::default(),
                },
                Op::Check { .. } => OpResult::Check,
            })
            .collect())
    }

    fn sync(&self, path: &str) -> KeeperResult<String> {
        self.begin(MockCall::new("sync", path))?;
        Ok(path.to_string())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.watches.lock().clear();
    }
}

/// Arguments of one dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    /// Connect string passed to the dialer.
    pub connect_string: String,
    /// Requested session timeout.
    pub session_timeout: Duration,
    /// Whether read-only servers were acceptable.
    pub can_be_read_only: bool,
}

/// A dialer that hands out queued mock connections in order.
///
/// With nothing queued a dial fails with `ConnectionLoss`.
#[derive(Default)]
pub struct MockDialer {
    queue: Mutex<VecDeque<KeeperResult<(Arc<MockConnection>, Receiver<SessionEvent>)>>>,
    requests: Mutex<Vec<DialRequest>>,
}

impl MockDialer {
    /// Creates a dialer with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a connection for the next dial and returns it with the
    /// sender of its raw session events.
    pub fn enqueue(&self) -> (Arc<MockConnection>, Sender<SessionEvent>) {
        let conn = Arc::new(MockConnection::new());
        let (tx, rx) = mpsc::channel();
        self.queue.lock().push_back(Ok((Arc::clone(&conn), rx)));
        (conn, tx)
    }

    /// Queues a connection whose session is already connected.
    pub fn enqueue_connected(&self, session_id: i64) -> (Arc<MockConnection>, Sender<SessionEvent>) {
        let (conn, tx) = self.enqueue();
        let _ = tx.send(SessionEvent::connected(session_id));
        (conn, tx)
    }

    /// Queues a failed dial.
    pub fn push_failure(&self, err: KeeperError) {
        self.queue.lock().push_back(Err(err));
    }

    /// Number of dials so far.
    pub fn dial_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Arguments of every dial so far.
    pub fn requests(&self) -> Vec<DialRequest> {
        self.requests.lock().clone()
    }
}

impl Dialer for MockDialer {
    fn dial(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        can_be_read_only: bool,
    ) -> KeeperResult<Dialed> {
        self.requests.lock().push(DialRequest {
            connect_string: connect_string.to_string(),
            session_timeout,
            can_be_read_only,
        });
        let (connection, events) = self
            .queue
            .lock()
            .pop_front()
            .unwrap_or(Err(KeeperError::ConnectionLoss))?;
        Ok(Dialed {
            connection,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_come_before_canned_responses() {
        let conn = MockConnection::new();
        conn.push_failures(KeeperError::ConnectionLoss, 2);
        conn.set_get_response("/a", Ok((b"x".to_vec(), Stat::default())));

        assert_eq!(conn.get("/a"), Err(KeeperError::ConnectionLoss));
        assert_eq!(conn.get("/a"), Err(KeeperError::ConnectionLoss));
        assert_eq!(conn.get("/a").unwrap().0, b"x".to_vec());
        assert_eq!(conn.call_count("get"), 3);
    }

    #[test]
    fn defaults() {
        let conn = MockConnection::new();
        assert_eq!(
            conn.create("/a", b"", CreateMode::Persistent, &[]).unwrap(),
            "/a"
        );
        assert_eq!(conn.exists("/a").unwrap(), None);
        assert_eq!(conn.get("/a"), Err(KeeperError::Unimplemented));
        assert_eq!(conn.sync("/a").unwrap(), "/a");
        assert_eq!(conn.attempts(), 4);
    }

    #[test]
    fn closed_connection_fails() {
        let conn = MockConnection::new();
        let (_, _, rx) = {
            conn.set_children_response("/", Ok((Vec::new(), Stat::default())));
            conn.children_w("/").unwrap()
        };
        conn.close();

        assert!(conn.is_closed());
        assert_eq!(conn.delete("/a", -1), Err(KeeperError::ConnectionLoss));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn fire_watch_is_one_shot() {
        let conn = MockConnection::new();
        let (_, rx) = conn.exists_w("/a").unwrap();
        assert_eq!(conn.watch_count(), 1);

        assert_eq!(conn.fire_watch("/a", EventType::NodeCreated), 1);
        assert_eq!(conn.fire_watch("/a", EventType::NodeCreated), 0);
        assert_eq!(rx.recv().unwrap().event_type, EventType::NodeCreated);
    }

    #[test]
    fn dialer_hands_out_in_order() {
        let dialer = MockDialer::new();
        dialer.push_failure(KeeperError::ConnectionLoss);
        let (conn, _tx) = dialer.enqueue_connected(7);

        assert!(dialer.dial("a:1", Duration::from_secs(1), false).is_err());
        let dialed = dialer.dial("a:1", Duration::from_secs(1), true).unwrap();
        assert_eq!(dialed.events.recv().unwrap(), SessionEvent::connected(7));
        dialed.connection.close();
        assert!(conn.is_closed());

        assert_eq!(dialer.dial_count(), 2);
        assert!(dialer.requests()[1].can_be_read_only);
        assert!(dialer.dial("a:1", Duration::from_secs(1), false).is_err());
    }
}
