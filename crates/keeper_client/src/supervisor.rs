//! The session supervisor.
//!
//! One dedicated thread per client owns the raw connection. It dials
//! through the retry policy, replays credentials, and then consumes the
//! raw session event channel, turning each event into state-machine steps.
//! This thread is the only writer of the connection state.

use crate::client::Engine;
use crate::connection::{Dialed, RawConnection};
use crate::context::CallContext;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryState;
use crate::state::{plan, Step};
use keeper_proto::SessionEvent;
use std::io;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the event pump wakes up without events.
const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    /// Keep consuming events from the same connection.
    Continue,
    /// The connection is unusable; dial again.
    Redial,
    /// The client is closing.
    Shutdown,
}

/// Starts the supervisor thread.
pub(crate) fn spawn(engine: Arc<Engine>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("keeper-supervisor".into())
        .spawn(move || run(&engine))
}

fn run(engine: &Engine) {
    let ctx = CallContext::background().cancelled_by(engine.shutdown.clone());
    info!(connect_string = %engine.ensemble.connection_string(), "supervisor started");

    while !ctx.is_cancelled() {
        let dialed = match dial(engine, &ctx) {
            Ok(dialed) => dialed,
            Err(ClientError::Cancelled) => break,
            Err(err) => {
                error!(%err, backoff = ?engine.config.redial_backoff, "dial round failed");
                engine.manager.lose();
                if ctx.sleep(engine.config.redial_backoff).is_err() {
                    break;
                }
                continue;
            }
        };

        authenticate(engine, dialed.connection.as_ref());
        let outcome = pump(engine, &dialed, &ctx);
        dialed.connection.close();
        if outcome == PumpOutcome::Shutdown {
            break;
        }
    }

    info!("supervisor stopped");
}

/// Dials until a connection is obtained or the retry policy stops.
fn dial(engine: &Engine, ctx: &CallContext) -> ClientResult<Dialed> {
    let mut retry = RetryState::new();
    loop {
        ctx.check()?;
        let connect_string = engine.ensemble.connection_string();
        debug!(%connect_string, attempt = retry.count() + 1, "dialing");

        let err = match engine.dialer.dial(
            &connect_string,
            engine.config.session_timeout,
            engine.config.can_be_read_only,
        ) {
            Ok(dialed) => return Ok(dialed),
            Err(err) if err.is_recoverable() => err,
            Err(err) => return Err(ClientError::Dial(err)),
        };

        warn!(%err, retries = retry.count(), "dial failed");
        if !retry.retry_after(engine.retry_policy.as_ref(), engine.sleeper.as_ref(), ctx)? {
            return Err(ClientError::Dial(err));
        }
    }
}

fn authenticate(engine: &Engine, conn: &dyn RawConnection) {
    for auth in &engine.config.auth {
        if let Err(err) = conn.add_auth(&auth.scheme, &auth.auth) {
            warn!(scheme = %auth.scheme, %err, "failed to add credentials");
        }
    }
}

/// Consumes raw events from one connection.
fn pump(engine: &Engine, dialed: &Dialed, ctx: &CallContext) -> PumpOutcome {
    loop {
        if ctx.is_cancelled() {
            return PumpOutcome::Shutdown;
        }

        let mut timeout = TICK;
        if let (Some(suspended), Some(max)) =
            (engine.manager.suspended_for(), engine.config.suspended_max)
        {
            if suspended >= max {
                warn!(?suspended, "suspended past the configured maximum");
                engine.manager.lose();
                return PumpOutcome::Redial;
            }
            timeout = timeout.min(max - suspended);
        }

        match dialed.events.recv_timeout(timeout) {
            Ok(event) => {
                let outcome = apply(engine, &dialed.connection, &event);
                if outcome != PumpOutcome::Continue {
                    return outcome;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("raw event channel closed");
                engine.manager.lose();
                return PumpOutcome::Redial;
            }
        }
    }
}

/// Applies one raw event to the state machine.
fn apply(engine: &Engine, conn: &Arc<dyn RawConnection>, event: &SessionEvent) -> PumpOutcome {
    let manager = &engine.manager;
    let snapshot = manager.snapshot();
    let steps = plan(
        snapshot.state,
        snapshot.session.as_ref().map(|s| s.id()),
        snapshot.read_only,
        event,
    );
    debug!(?event, state = ?snapshot.state, ?steps, "raw session event");

    let mut outcome = PumpOutcome::Continue;
    for step in steps {
        match step {
            Step::Suspend => manager.suspend(),
            Step::Resume { read_only } => {
                if let Some(session) = &snapshot.session {
                    engine.registry.rearm(session);
                }
                manager.resume(read_only);
            }
            Step::Lose => {
                manager.lose();
                outcome = PumpOutcome::Redial;
            }
            Step::Establish {
                session_id,
                read_only,
            } => {
                let session = manager.new_session(session_id, Arc::clone(conn));
                engine.registry.rearm(&session);
                manager.establish(session, read_only);
                outcome = PumpOutcome::Continue;
            }
            Step::ReadOnly(read_only) => manager.set_read_only(read_only),
        }
    }
    outcome
}
