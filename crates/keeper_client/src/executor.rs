//! The operation façade.
//!
//! Every tree operation runs through [`OperationExecutor::execute`]:
//!
//! 1. Validate the caller path and apply the namespace
//! 2. Compress outgoing payloads and resolve the ACL to apply
//! 3. Acquire the current session, waiting while `Latent`/`Suspended`
//! 4. Issue one raw call per attempt, timed through the tracer
//! 5. Classify the result: success, recoverable (ask the retry policy),
//!    or domain (surface immediately)
//!
//! Decompression runs on the result of a successful raw call before the
//! outcome is counted; it never causes a retry. Watch registration happens
//! afterwards.

use crate::client::Engine;
use crate::connection::RawConnection;
use crate::context::CallContext;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryState;
use crate::state::{ConnectionState, Session};
use crate::watch::{WatchKind, Watcher};
use keeper_proto::path::{self, ancestors, apply_namespace, strip_namespace, validate_path};
use keeper_proto::{Acl, CreateMode, KeeperError, KeeperResult, Op, OpResult, Stat, ANY_VERSION};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Options for [`OperationExecutor::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Creation mode.
    pub mode: CreateMode,
    /// Explicit ACL; `None` asks the ACL provider.
    pub acl: Option<Vec<Acl>>,
    /// Create missing ancestors as persistent nodes.
    pub creating_parents: bool,
}

impl CreateOptions {
    /// Persistent node, provider ACL, no parents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the creation mode.
    pub fn with_mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Uses `acl` instead of the provider ACL.
    pub fn with_acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Creates missing ancestors.
    pub fn creating_parents(mut self, enabled: bool) -> Self {
        self.creating_parents = enabled;
        self
    }
}

/// Options for [`OperationExecutor::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Expected version, or [`ANY_VERSION`].
    pub version: i32,
    /// Delete descendants first.
    pub deleting_children: bool,
}

impl DeleteOptions {
    /// Unconditional delete of a leaf.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expected version.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Deletes descendants depth-first before the node itself.
    pub fn deleting_children(mut self, enabled: bool) -> Self {
        self.deleting_children = enabled;
        self
    }
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            version: ANY_VERSION,
            deleting_children: false,
        }
    }
}

/// Retrying, compressing, ACL-injecting front for every tree operation.
#[derive(Clone)]
pub struct OperationExecutor {
    engine: Arc<Engine>,
    namespace: Option<String>,
}

impl OperationExecutor {
    pub(crate) fn new(engine: Arc<Engine>, namespace: Option<String>) -> Self {
        Self { engine, namespace }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Namespace applied to every path, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Creates a node and returns its assigned path.
    pub fn create(
        &self,
        ctx: &CallContext,
        path: &str,
        data: &[u8],
        options: &CreateOptions,
    ) -> ClientResult<String> {
        validate_path(path, options.mode.is_sequential())?;
        let full = self.full_path(path);
        let payload = self.compress(path, data)?;
        let acl = match &options.acl {
            Some(acl) => acl.clone(),
            None => self.acl_for(path)?,
        };
        let parents = if options.creating_parents {
            self.parents_with_acl(&full)?
        } else {
            Vec::new()
        };
        let mode = options.mode;

        let created = self.execute(ctx, "create", |session| {
            let conn = session.connection();
            match conn.create(&full, &payload, mode, &acl) {
                Err(KeeperError::NoNode) if !parents.is_empty() => {
                    create_missing(conn, &parents)?;
                    conn.create(&full, &payload, mode, &acl)
                }
                other => other,
            }
        })?;
        Ok(self.caller_path(&created))
    }

    /// Returns the node's metadata, or `None` if it does not exist.
    pub fn exists(&self, ctx: &CallContext, path: &str) -> ClientResult<Option<Stat>> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        self.execute(ctx, "exists", |session| session.connection().exists(&full))
    }

    /// Like [`OperationExecutor::exists`], leaving an existence watch.
    pub fn exists_watched(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> ClientResult<(Option<Stat>, Watcher)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let (stat, raw, session) = self.execute(ctx, "exists", |session| {
            let (stat, raw) = session.connection().exists_w(&full)?;
            Ok((stat, raw, Arc::clone(session)))
        })?;
        let watcher = self.register(full, WatchKind::Exists, raw, &session);
        Ok((stat, watcher))
    }

    /// Returns the node's decompressed data and metadata.
    pub fn get(&self, ctx: &CallContext, path: &str) -> ClientResult<(Vec<u8>, Stat)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        self.execute_then(
            ctx,
            "get",
            |session| session.connection().get(&full),
            |(data, stat)| Ok((self.decompress(path, &data)?, stat)),
        )
    }

    /// Like [`OperationExecutor::get`], leaving a data watch.
    pub fn get_watched(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> ClientResult<(Vec<u8>, Stat, Watcher)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let (data, stat, raw, session) = self.execute_then(
            ctx,
            "get",
            |session| {
                let (data, stat, raw) = session.connection().get_w(&full)?;
                Ok((data, stat, raw, Arc::clone(session)))
            },
            |(data, stat, raw, session)| Ok((self.decompress(path, &data)?, stat, raw, session)),
        )?;
        let watcher = self.register(full, WatchKind::Data, raw, &session);
        Ok((data, stat, watcher))
    }

    /// Replaces the node's data if its version matches.
    pub fn set(
        &self,
        ctx: &CallContext,
        path: &str,
        data: &[u8],
        version: i32,
    ) -> ClientResult<Stat> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let payload = self.compress(path, data)?;
        self.execute(ctx, "set", |session| {
            session.connection().set(&full, &payload, version)
        })
    }

    /// Deletes a node.
    pub fn delete(&self, ctx: &CallContext, path: &str, options: &DeleteOptions) -> ClientResult<()> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let options = *options;
        self.execute(ctx, "delete", |session| {
            let conn = session.connection();
            if options.deleting_children {
                delete_descendants(conn, &full)?;
            }
            conn.delete(&full, options.version)
        })
    }

    /// Lists the node's children.
    pub fn children(&self, ctx: &CallContext, path: &str) -> ClientResult<(Vec<String>, Stat)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        self.execute(ctx, "children", |session| session.connection().children(&full))
    }

    /// Like [`OperationExecutor::children`], leaving a child watch.
    pub fn children_watched(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> ClientResult<(Vec<String>, Stat, Watcher)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let (children, stat, raw, session) = self.execute(ctx, "children", |session| {
            let (children, stat, raw) = session.connection().children_w(&full)?;
            Ok((children, stat, raw, Arc::clone(session)))
        })?;
        let watcher = self.register(full, WatchKind::Children, raw, &session);
        Ok((children, stat, watcher))
    }

    /// Returns the node's ACL.
    pub fn get_acl(&self, ctx: &CallContext, path: &str) -> ClientResult<(Vec<Acl>, Stat)> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        self.execute(ctx, "get_acl", |session| session.connection().get_acl(&full))
    }

    /// Replaces the node's ACL. `None` applies the provider ACL.
    pub fn set_acl(
        &self,
        ctx: &CallContext,
        path: &str,
        acl: Option<&[Acl]>,
        version: i32,
    ) -> ClientResult<Stat> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let acl = match acl {
            Some(acl) => acl.to_vec(),
            None => self.acl_for(path)?,
        };
        self.execute(ctx, "set_acl", |session| {
            session.connection().set_acl(&full, &acl, version)
        })
    }

    /// Flushes the leader channel for `path`.
    pub fn sync(&self, ctx: &CallContext, path: &str) -> ClientResult<String> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let synced = self.execute(ctx, "sync", |session| session.connection().sync(&full))?;
        Ok(self.caller_path(&synced))
    }

    /// Applies every op atomically.
    ///
    /// A failed constituent fails the whole call with `MultiOpFailed`. The
    /// multi is retried as a unit only when the request as a whole failed
    /// for a connection-level reason.
    pub fn multi(&self, ctx: &CallContext, ops: Vec<Op>) -> ClientResult<Vec<OpResult>> {
        let ops = ops
            .into_iter()
            .map(|op| self.prepare_op(op))
            .collect::<ClientResult<Vec<_>>>()?;

        let results = self.execute(ctx, "multi", |session| session.connection().multi(&ops))?;
        if results.iter().any(|r| r.error().is_some()) {
            return Err(ClientError::MultiOpFailed { results });
        }
        Ok(results
            .into_iter()
            .map(|r| match r {
                OpResult::Create { path } => OpResult::Create {
                    path: self.caller_path(&path),
                },
                other => other,
            })
            .collect())
    }

    /// Creates `path` and every missing ancestor as empty persistent nodes.
    pub fn ensure_path(&self, ctx: &CallContext, path: &str) -> ClientResult<()> {
        validate_path(path, false)?;
        let full = self.full_path(path);
        let mut nodes = self.parents_with_acl(&full)?;
        if full != "/" {
            nodes.push((full.clone(), self.acl_for(path)?));
        }
        self.execute(ctx, "ensure_path", |session| {
            create_missing(session.connection(), &nodes)
        })
    }

    /// Runs `call` under the retry loop.
    fn execute<T, F>(&self, ctx: &CallContext, op: &'static str, call: F) -> ClientResult<T>
    where
        F: FnMut(&Arc<Session>) -> KeeperResult<T>,
    {
        self.execute_then(ctx, op, call, Ok)
    }

    /// Like [`OperationExecutor::execute`], passing the raw result through
    /// `finish` before the outcome is counted. A `finish` error is never
    /// retried and counts as a failure.
    fn execute_then<T, U, F, G>(
        &self,
        ctx: &CallContext,
        op: &'static str,
        mut call: F,
        finish: G,
    ) -> ClientResult<U>
    where
        F: FnMut(&Arc<Session>) -> KeeperResult<T>,
        G: FnOnce(T) -> ClientResult<U>,
    {
        let engine = &*self.engine;
        let mut retry = RetryState::new();

        loop {
            let session = match ctx.check().and_then(|()| self.acquire_session(ctx)) {
                Ok(session) => session,
                Err(err) => {
                    if retry.count() > 0 {
                        self.add_count(op, "failure");
                    }
                    return Err(err);
                }
            };

            let started = Instant::now();
            let result = call(&session);
            self.add_time(op, started.elapsed());

            let err = match result {
                Ok(value) => {
                    let finished = finish(value);
                    let outcome = if finished.is_ok() { "success" } else { "failure" };
                    self.add_count(op, outcome);
                    return finished;
                }
                Err(err) if err.is_recoverable() => err,
                Err(err) => {
                    self.add_count(op, "failure");
                    return Err(ClientError::Domain(err));
                }
            };

            let decision = ctx.check().and_then(|()| {
                retry.retry_after(engine.retry_policy.as_ref(), engine.sleeper.as_ref(), ctx)
            });
            match decision {
                Ok(true) => {
                    self.add_count(op, "retry");
                    debug!(op, %err, retries = retry.count(), "retrying operation");
                }
                Ok(false) => {
                    self.add_count(op, "failure");
                    let attempts = retry.count() + 1;
                    warn!(op, %err, attempts, "retries exhausted");
                    return Err(ClientError::RetriesExhausted {
                        attempts,
                        source: err,
                    });
                }
                Err(stop) => {
                    self.add_count(op, "failure");
                    return Err(stop);
                }
            }
        }
    }

    /// Returns the live session, waiting while the state is pending.
    fn acquire_session(&self, ctx: &CallContext) -> ClientResult<Arc<Session>> {
        let manager = &self.engine.manager;
        if manager.is_closed() {
            return Err(ClientError::Closed);
        }

        let mut snapshot = manager.snapshot();
        if snapshot.state.is_pending() {
            debug!(state = ?snapshot.state, "waiting for a usable connection");
            let wait = ctx.narrowed(Instant::now() + self.engine.config.connection_timeout);
            snapshot = match manager.await_settled(&wait) {
                Ok(snapshot) => snapshot,
                Err(ClientError::DeadlineExceeded) if !ctx.deadline_passed() => {
                    return Err(ClientError::SuspendedTimeout)
                }
                Err(err) => return Err(err),
            };
        }

        match (snapshot.state, snapshot.session) {
            (ConnectionState::Connected, Some(session)) => Ok(session),
            _ => Err(ClientError::ConnectionLost),
        }
    }

    fn register(
        &self,
        full: String,
        kind: WatchKind,
        raw: crate::connection::WatchReceiver,
        session: &Arc<Session>,
    ) -> Watcher {
        self.engine
            .registry
            .register(full, kind, self.namespace.clone(), raw, session)
    }

    fn prepare_op(&self, op: Op) -> ClientResult<Op> {
        match op {
            Op::Create {
                path,
                data,
                acl,
                mode,
            } => {
                validate_path(&path, mode.is_sequential())?;
                let data = self.compress(&path, &data)?;
                let acl = if acl.is_empty() {
                    self.acl_for(&path)?
                } else {
                    acl
                };
                Ok(Op::Create {
                    path: self.full_path(&path),
                    data,
                    acl,
                    mode,
                })
            }
            Op::SetData {
                path,
                data,
                version,
            } => {
                validate_path(&path, false)?;
                let data = self.compress(&path, &data)?;
                Ok(Op::SetData {
                    path: self.full_path(&path),
                    data,
                    version,
                })
            }
            other => {
                validate_path(other.path(), false)?;
                let full = self.full_path(other.path());
                Ok(other.with_path(full))
            }
        }
    }

    fn full_path(&self, path: &str) -> String {
        apply_namespace(self.namespace.as_deref(), path)
    }

    fn caller_path(&self, path: &str) -> String {
        strip_namespace(self.namespace.as_deref(), path)
    }

    /// Every proper ancestor of `full` with the ACL to create it with.
    fn parents_with_acl(&self, full: &str) -> ClientResult<Vec<(String, Vec<Acl>)>> {
        ancestors(full)
            .into_iter()
            .map(|parent| {
                let acl = self.acl_for(&self.caller_path(&parent))?;
                Ok((parent, acl))
            })
            .collect()
    }

    fn compress(&self, path: &str, data: &[u8]) -> ClientResult<Vec<u8>> {
        let provider = &self.engine.compression;
        match panic::catch_unwind(AssertUnwindSafe(|| provider.compress(path, data))) {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(err)) => Err(ClientError::encoding(path, err.0)),
            Err(panic) => Err(ClientError::encoding(path, panic_message(panic.as_ref()))),
        }
    }

    fn decompress(&self, path: &str, data: &[u8]) -> ClientResult<Vec<u8>> {
        let provider = &self.engine.compression;
        match panic::catch_unwind(AssertUnwindSafe(|| provider.decompress(path, data))) {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(err)) => Err(ClientError::encoding(path, err.0)),
            Err(panic) => Err(ClientError::encoding(path, panic_message(panic.as_ref()))),
        }
    }

    /// Per-path override if present, else the default ACL.
    fn acl_for(&self, path: &str) -> ClientResult<Vec<Acl>> {
        let provider = &self.engine.acl;
        let acl = panic::catch_unwind(AssertUnwindSafe(|| {
            provider
                .acl_for_path(path)
                .unwrap_or_else(|| provider.default_acl())
        }))
        .map_err(|panic| ClientError::acl_provider(path, panic_message(panic.as_ref())))?;

        if acl.is_empty() {
            return Err(ClientError::acl_provider(path, "provider returned an empty ACL"));
        }
        Ok(acl)
    }

    fn add_time(&self, op: &'static str, elapsed: Duration) {
        let tracer = &self.engine.tracer;
        if panic::catch_unwind(AssertUnwindSafe(|| tracer.add_time(op, elapsed))).is_err() {
            warn!(op, "tracer panicked, sample dropped");
        }
    }

    fn add_count(&self, op: &'static str, outcome: &str) {
        let tracer = &self.engine.tracer;
        let name = format!("{op}.{outcome}");
        if panic::catch_unwind(AssertUnwindSafe(|| tracer.add_count(&name, 1))).is_err() {
            warn!(%name, "tracer panicked, sample dropped");
        }
    }
}

impl fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Creates each node in order, skipping ones that already exist.
fn create_missing(conn: &dyn RawConnection, nodes: &[(String, Vec<Acl>)]) -> KeeperResult<()> {
    for (node, acl) in nodes {
        match conn.create(node, &[], CreateMode::Persistent, acl) {
            Ok(_) | Err(KeeperError::NodeExists) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Deletes every descendant of `full`, depth-first.
fn delete_descendants(conn: &dyn RawConnection, full: &str) -> KeeperResult<()> {
    let children = match conn.children(full) {
        Ok((children, _)) => children,
        Err(KeeperError::NoNode) => return Ok(()),
        Err(err) => return Err(err),
    };
    for child in children {
        let child_path = path::join(full, &child);
        delete_descendants(conn, &child_path)?;
        match conn.delete(&child_path, ANY_VERSION) {
            Ok(()) | Err(KeeperError::NoNode) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
