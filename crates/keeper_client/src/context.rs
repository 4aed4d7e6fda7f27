//! Deadlines and cooperative cancellation for calls.
//!
//! Every public operation takes a [`CallContext`]. Cancellation is checked
//! before each attempt and at every suspension point; a raw call already
//! in flight always completes its round-trip first.

use crate::error::{ClientError, ClientResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and wakes every waiter.
    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.wake.notify_all();
    }

    /// Returns true once [`CancelToken::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Blocks until `until` passes or the token is cancelled.
    ///
    /// Returns true if the wait ended because of cancellation.
    pub fn wait_until(&self, until: Instant) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.wake.wait_until(&mut cancelled, until).timed_out() {
                return *cancelled;
            }
        }
        true
    }
}

/// Deadline and cancellation scope of one logical call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: Option<CancelToken>,
}

impl CallContext {
    /// A context with no deadline that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context with an absolute deadline.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: None,
        }
    }

    /// Attaches a cancellation token.
    pub fn cancelled_by(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The same context with its deadline pulled in to at most `deadline`.
    pub(crate) fn narrowed(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
            token: self.token.clone(),
        }
    }

    /// Returns true if the caller's own deadline has passed.
    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns true if the attached token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Fails with `Cancelled` or `DeadlineExceeded` if the call must stop.
    pub fn check(&self) -> ClientResult<()> {
        if self.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ClientError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> ClientResult<()> {
        self.check()?;

        let wake_at = Instant::now() + duration;
        let (until, hits_deadline) = match self.deadline {
            Some(deadline) if deadline < wake_at => (deadline, true),
            _ => (wake_at, false),
        };

        let cancelled = match &self.token {
            Some(token) => token.wait_until(until),
            None => {
                std::thread::sleep(until.saturating_duration_since(Instant::now()));
                false
            }
        };

        if cancelled {
            Err(ClientError::Cancelled)
        } else if hits_deadline {
            Err(ClientError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}
