//! Retry policies and sleepers.
//!
//! A [`RetryPolicy`] decides, from the retry count and the elapsed time,
//! whether a failed attempt is retried and how long to wait first. The
//! wait itself goes through a [`RetrySleeper`] so tests can observe the
//! requested durations without real delays.

use crate::context::CallContext;
use crate::error::ClientResult;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::warn;

/// What a policy wants to happen after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the duration, then try again.
    Retry(Duration),
    /// Give up.
    Stop,
}

/// Decides whether to retry a recoverable failure.
///
/// Implementations must be able to answer [`RetryDecision::Stop`]; the
/// engine honours it unconditionally.
pub trait RetryPolicy: Send + Sync {
    /// Called with the number of retries already made (0 after the first
    /// failed attempt) and the time since the first attempt started.
    fn decide(&self, retry_count: u32, elapsed: Duration) -> RetryDecision;
}

/// Performs the wait between attempts.
pub trait RetrySleeper: Send + Sync {
    /// Blocks for `duration`. An error stops the retry loop and is
    /// propagated to the caller as-is.
    fn sleep_for(&self, duration: Duration, ctx: &CallContext) -> ClientResult<()>;
}

/// Sleeps on the calling thread, waking early on cancellation or deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl RetrySleeper for ThreadSleeper {
    fn sleep_for(&self, duration: Duration, ctx: &CallContext) -> ClientResult<()> {
        ctx.sleep(duration)
    }
}

/// Retry bookkeeping for one logical operation.
#[derive(Debug, Clone)]
pub struct RetryState {
    count: u32,
    started: Instant,
}

impl RetryState {
    /// Starts tracking a new operation.
    pub fn new() -> Self {
        Self {
            count: 0,
            started: Instant::now(),
        }
    }

    /// Number of retries made so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Time since the first attempt.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Consults the policy after a recoverable failure.
    ///
    /// Returns `Ok(true)` after sleeping when another attempt should be
    /// made, `Ok(false)` when the policy stops.
    pub fn retry_after(
        &mut self,
        policy: &dyn RetryPolicy,
        sleeper: &dyn RetrySleeper,
        ctx: &CallContext,
    ) -> ClientResult<bool> {
        match policy.decide(self.count, self.elapsed()) {
            RetryDecision::Stop => Ok(false),
            RetryDecision::Retry(delay) => {
                sleeper.sleep_for(delay, ctx)?;
                self.count += 1;
                Ok(true)
            }
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Retries a fixed number of times with a constant pause.
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    n: u32,
    sleep_between: Duration,
}

impl RetryNTimes {
    /// Creates a policy allowing `n` retries.
    pub fn new(n: u32, sleep_between: Duration) -> Self {
        Self { n, sleep_between }
    }
}

impl RetryPolicy for RetryNTimes {
    fn decide(&self, retry_count: u32, _elapsed: Duration) -> RetryDecision {
        if retry_count < self.n {
            RetryDecision::Retry(self.sleep_between)
        } else {
            RetryDecision::Stop
        }
    }
}

/// Retries exactly once.
#[derive(Debug, Clone)]
pub struct RetryOneTime(RetryNTimes);

impl RetryOneTime {
    /// Creates the policy.
    pub fn new(sleep_between: Duration) -> Self {
        Self(RetryNTimes::new(1, sleep_between))
    }
}

impl RetryPolicy for RetryOneTime {
    fn decide(&self, retry_count: u32, elapsed: Duration) -> RetryDecision {
        self.0.decide(retry_count, elapsed)
    }
}

/// Retries with a constant pause until a total time budget is spent.
#[derive(Debug, Clone)]
pub struct RetryUntilElapsed {
    max_elapsed: Duration,
    sleep_between: Duration,
}

impl RetryUntilElapsed {
    /// Creates the policy.
    pub fn new(max_elapsed: Duration, sleep_between: Duration) -> Self {
        Self {
            max_elapsed,
            sleep_between,
        }
    }
}

impl RetryPolicy for RetryUntilElapsed {
    fn decide(&self, _retry_count: u32, elapsed: Duration) -> RetryDecision {
        if elapsed < self.max_elapsed {
            RetryDecision::Retry(self.sleep_between)
        } else {
            RetryDecision::Stop
        }
    }
}

const MAX_RETRIES_LIMIT: u32 = 29;

/// Retries a bounded number of times with randomized exponential backoff.
///
/// The pause before retry `n` is `base_sleep * r` where `r` is drawn from
/// `[1, 2^(n+1))`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_retries: u32,
}

impl ExponentialBackoffRetry {
    /// Creates the policy. `max_retries` is capped at 29.
    pub fn new(base_sleep: Duration, max_retries: u32) -> Self {
        if max_retries > MAX_RETRIES_LIMIT {
            warn!(
                max_retries,
                limit = MAX_RETRIES_LIMIT,
                "max_retries too large, capping"
            );
        }
        Self {
            base_sleep,
            max_retries: max_retries.min(MAX_RETRIES_LIMIT),
        }
    }

    /// Returns the effective retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn sleep_time(&self, retry_count: u32) -> Duration {
        let upper = 1u32 << (retry_count.min(MAX_RETRIES_LIMIT) + 1);
        let factor = rand::thread_rng().gen_range(1..upper.max(2));
        self.base_sleep.saturating_mul(factor)
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn decide(&self, retry_count: u32, _elapsed: Duration) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry(self.sleep_time(retry_count))
        } else {
            RetryDecision::Stop
        }
    }
}

/// Exponential backoff whose individual pauses never exceed a ceiling.
#[derive(Debug, Clone)]
pub struct BoundedExponentialBackoffRetry {
    inner: ExponentialBackoffRetry,
    max_sleep: Duration,
}

impl BoundedExponentialBackoffRetry {
    /// Creates the policy.
    pub fn new(base_sleep: Duration, max_sleep: Duration, max_retries: u32) -> Self {
        Self {
            inner: ExponentialBackoffRetry::new(base_sleep, max_retries),
            max_sleep,
        }
    }
}

impl RetryPolicy for BoundedExponentialBackoffRetry {
    fn decide(&self, retry_count: u32, elapsed: Duration) -> RetryDecision {
        match self.inner.decide(retry_count, elapsed) {
            RetryDecision::Retry(delay) => RetryDecision::Retry(delay.min(self.max_sleep)),
            RetryDecision::Stop => RetryDecision::Stop,
        }
    }
}
