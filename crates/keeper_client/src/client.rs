//! The client façade and its builder.

use crate::acl::{AclProvider, DefaultAclProvider};
use crate::compression::{CompressionProvider, NoCompression};
use crate::config::ClientConfig;
use crate::connection::{Dialer, EnsembleProvider, FixedEnsembleProvider};
use crate::context::{CallContext, CancelToken};
use crate::error::{ClientError, ClientResult};
use crate::executor::OperationExecutor;
use crate::retry::{ExponentialBackoffRetry, RetryPolicy, RetrySleeper, ThreadSleeper};
use crate::state::{ConnectionState, ConnectionStateManager, StateEvent, StateSnapshot};
use crate::supervisor;
use crate::tracer::{NoopTracer, TracerDriver};
use crate::watch::WatchRegistry;
use keeper_proto::KeeperError;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Everything a client's executors and its supervisor share.
pub(crate) struct Engine {
    pub(crate) config: ClientConfig,
    pub(crate) manager: ConnectionStateManager,
    pub(crate) registry: Arc<WatchRegistry>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) ensemble: Arc<dyn EnsembleProvider>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) sleeper: Arc<dyn RetrySleeper>,
    pub(crate) compression: Arc<dyn CompressionProvider>,
    pub(crate) acl: Arc<dyn AclProvider>,
    pub(crate) tracer: Arc<dyn TracerDriver>,
    pub(crate) shutdown: CancelToken,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Stops the supervisor, wakes every waiter and terminates every
    /// watch. Idempotent.
    fn close(&self) {
        if self.manager.is_closed() {
            return;
        }
        info!("closing client");
        self.shutdown.cancel();
        self.manager.close();
        self.registry.close();
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                error!("supervisor thread panicked");
            }
        }
    }
}

/// Closes the engine once the last client handle goes away. The supervisor
/// holds the engine itself, so engine drop alone never runs.
struct Lifecycle(Arc<Engine>);

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A resilient coordination-service client.
///
/// Cloning is cheap; clones and [`Client::using_namespace`] façades share
/// one session, one supervisor and one watch registry. Dropping the last
/// of them closes the client.
///
/// # Example
///
/// ```rust,ignore
/// use keeper_client::{CallContext, Client, ClientConfig, CreateOptions};
///
/// let client = Client::builder(ClientConfig::new("zk1:2181"), dialer).build();
/// client.start()?;
/// client.block_until_connected(Duration::from_secs(10))?;
/// client.create(&CallContext::background(), "/a", b"v", &CreateOptions::new())?;
/// client.close();
/// ```
#[derive(Clone)]
pub struct Client {
    executor: OperationExecutor,
    lifecycle: Arc<Lifecycle>,
}

impl Client {
    /// Starts building a client that dials through `dialer`.
    pub fn builder(config: ClientConfig, dialer: Arc<dyn Dialer>) -> ClientBuilder {
        ClientBuilder::new(config, dialer)
    }

    fn engine(&self) -> &Arc<Engine> {
        self.executor.engine()
    }

    /// Starts the supervisor. The first session is established in the
    /// background; operations issued meanwhile wait for it.
    pub fn start(&self) -> ClientResult<()> {
        let engine = self.engine();
        if engine.manager.is_closed() {
            return Err(ClientError::Closed);
        }
        if engine.started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyStarted);
        }

        let handle = supervisor::spawn(Arc::clone(engine)).map_err(|err| {
            error!(%err, "failed to spawn supervisor");
            ClientError::Dial(KeeperError::SystemError)
        })?;
        *engine.supervisor.lock() = Some(handle);
        Ok(())
    }

    /// Stops the supervisor, closes the raw connection, wakes every waiter
    /// and terminates every watch. Idempotent.
    pub fn close(&self) {
        self.engine().close();
    }

    /// Returns true once [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.engine().manager.is_closed()
    }

    /// Non-blocking snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        self.engine().manager.current_state()
    }

    /// Non-blocking snapshot of the connection state and session.
    pub fn snapshot(&self) -> StateSnapshot {
        self.engine().manager.snapshot()
    }

    /// Blocks until `predicate` holds for the connection state.
    pub fn await_state<F>(&self, predicate: F, ctx: &CallContext) -> ClientResult<StateSnapshot>
    where
        F: Fn(ConnectionState) -> bool,
    {
        self.engine().manager.await_state(predicate, ctx)
    }

    /// Blocks until the client is connected or `timeout` elapses.
    pub fn block_until_connected(&self, timeout: Duration) -> ClientResult<()> {
        self.await_state(|s| s.is_connected(), &CallContext::with_timeout(timeout))
            .map(|_| ())
    }

    /// Returns the current state and a receiver of every later change.
    pub fn subscribe_state(&self) -> (StateSnapshot, Receiver<StateEvent>) {
        self.engine().manager.subscribe()
    }

    /// Number of outstanding watches across every façade of this client.
    pub fn outstanding_watches(&self) -> usize {
        self.engine().registry.len()
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.engine().config
    }

    /// A façade over the same session with a different namespace.
    pub fn using_namespace(&self, namespace: Option<&str>) -> Client {
        let namespace = namespace
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty());
        Client {
            executor: OperationExecutor::new(Arc::clone(self.engine()), namespace),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl Deref for Client {
    type Target = OperationExecutor;

    fn deref(&self) -> &Self::Target {
        &self.executor
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connect_string", &self.config().connect_string)
            .field("namespace", &self.namespace())
            .field("state", &self.state())
            .finish()
    }
}

/// Assembles a [`Client`] from a configuration and its collaborators.
pub struct ClientBuilder {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    ensemble: Option<Arc<dyn EnsembleProvider>>,
    retry_policy: Arc<dyn RetryPolicy>,
    sleeper: Arc<dyn RetrySleeper>,
    compression: Arc<dyn CompressionProvider>,
    acl: Arc<dyn AclProvider>,
    tracer: Arc<dyn TracerDriver>,
}

impl ClientBuilder {
    /// Creates a builder with default collaborators.
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config,
            dialer,
            ensemble: None,
            retry_policy: Arc::new(ExponentialBackoffRetry::new(Duration::from_secs(1), 3)),
            sleeper: Arc::new(ThreadSleeper),
            compression: Arc::new(NoCompression),
            acl: Arc::new(DefaultAclProvider::default()),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Uses `ensemble` instead of the config's fixed connect string.
    pub fn with_ensemble_provider(mut self, ensemble: Arc<dyn EnsembleProvider>) -> Self {
        self.ensemble = Some(ensemble);
        self
    }

    /// Sets the retry policy for operations and dials.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the sleeper used between attempts.
    pub fn with_retry_sleeper(mut self, sleeper: Arc<dyn RetrySleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Sets the payload compression provider.
    pub fn with_compression(mut self, compression: Arc<dyn CompressionProvider>) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the ACL provider.
    pub fn with_acl_provider(mut self, acl: Arc<dyn AclProvider>) -> Self {
        self.acl = acl;
        self
    }

    /// Sets the tracer driver.
    pub fn with_tracer(mut self, tracer: Arc<dyn TracerDriver>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Builds the client. Nothing is dialed until [`Client::start`].
    pub fn build(self) -> Client {
        let ensemble = self.ensemble.unwrap_or_else(|| {
            Arc::new(FixedEnsembleProvider::new(self.config.connect_string.clone()))
        });
        let namespace = self.config.namespace.clone();
        let engine = Arc::new(Engine {
            config: self.config,
            manager: ConnectionStateManager::new(),
            registry: Arc::new(WatchRegistry::new()),
            dialer: self.dialer,
            ensemble,
            retry_policy: self.retry_policy,
            sleeper: self.sleeper,
            compression: self.compression,
            acl: self.acl,
            tracer: self.tracer,
            shutdown: CancelToken::new(),
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });
        Client {
            executor: OperationExecutor::new(Arc::clone(&engine), namespace),
            lifecycle: Arc::new(Lifecycle(engine)),
        }
    }
}
