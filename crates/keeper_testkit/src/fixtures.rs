//! Client fixtures.
//!
//! Provides clients wired to an [`InMemoryEnsemble`] with instant retry
//! sleeps and a recording tracer, plus helpers for waiting on the
//! asynchronous parts of the state machine.

use crate::ensemble::InMemoryEnsemble;
use crate::recording::{CountingSleeper, RecordingTracer};
use keeper_client::{
    CallContext, Client, ClientBuilder, ClientConfig, ConnectionState, RetryNTimes, SessionId,
    StateEvent,
};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long fixture helpers wait before giving up.
pub const WAIT: Duration = Duration::from_secs(5);

/// A configuration suited to tests: short timeouts, fast redials.
pub fn fast_config() -> ClientConfig {
    ClientConfig::new("mem:1")
        .with_session_timeout(Duration::from_secs(30))
        .with_connection_timeout(Duration::from_secs(2))
        .with_redial_backoff(Duration::from_millis(10))
}

/// A client bound to its own in-memory ensemble.
pub struct TestClient {
    /// The client under test.
    pub client: Client,
    /// The ensemble it talks to.
    pub ensemble: InMemoryEnsemble,
    /// Receives every trace the client emits.
    pub tracer: Arc<RecordingTracer>,
    /// Records retry sleeps.
    pub sleeper: Arc<CountingSleeper>,
}

impl TestClient {
    /// A started client that has reached `Connected`.
    ///
    /// The retry policy allows two retries.
    pub fn connected() -> Self {
        Self::with_config(fast_config(), |b| {
            b.with_retry_policy(Arc::new(RetryNTimes::new(2, Duration::from_millis(1))))
        })
    }

    /// A started, connected client with a custom configuration and builder.
    pub fn with_config(
        config: ClientConfig,
        customize: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Self {
        let fixture = Self::unstarted(InMemoryEnsemble::new(), config, customize);
        fixture.client.start().expect("Failed to start client");
        fixture
            .client
            .block_until_connected(WAIT)
            .expect("Client did not connect");
        fixture
    }

    /// A client that has not been started, against the given ensemble.
    pub fn unstarted(
        ensemble: InMemoryEnsemble,
        config: ClientConfig,
        customize: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Self {
        let tracer = Arc::new(RecordingTracer::new());
        let sleeper = Arc::new(CountingSleeper::new());
        let builder = Client::builder(config, Arc::new(ensemble.clone()))
            .with_tracer(tracer.clone())
            .with_retry_sleeper(sleeper.clone());
        Self {
            client: customize(builder).build(),
            ensemble,
            tracer,
            sleeper,
        }
    }

    /// Session the client currently holds.
    pub fn session_id(&self) -> SessionId {
        self.client
            .snapshot()
            .session
            .map(|s| s.id())
            .expect("Client has no session")
    }

    /// Blocks until the client reaches `state`.
    pub fn wait_for(&self, state: ConnectionState) {
        self.client
            .await_state(|s| s == state, &CallContext::with_timeout(WAIT))
            .unwrap_or_else(|e| panic!("Client never reached {state:?}: {e}"));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.close();
    }
}

/// Polls `check` until it holds or [`WAIT`] passes.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Collects target states from `events` until `until` is reached.
pub fn collect_states(
    events: &Receiver<StateEvent>,
    until: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(WAIT) {
        if let StateEvent::Transition { to, .. } = event {
            seen.push(to);
            if to == until {
                break;
            }
        }
    }
    seen
}
