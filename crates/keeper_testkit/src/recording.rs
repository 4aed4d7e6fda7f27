//! Recording collaborators.
//!
//! [`RecordingTracer`] keeps every time and count it receives.
//! [`CountingSleeper`] records retry sleeps without actually sleeping, so
//! retry tests run instantly and can assert on the exact backoff.

use keeper_client::{CallContext, ClientResult, RetrySleeper, TracerDriver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// A tracer that records everything.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    times: Mutex<Vec<(String, Duration)>>,
    counts: Mutex<HashMap<String, u64>>,
}

impl RecordingTracer {
    /// Creates an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total of a counter, zero if never incremented.
    pub fn count(&self, name: &str) -> u64 {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    /// Number of timings recorded under `name`.
    pub fn timings(&self, name: &str) -> usize {
        self.times.lock().iter().filter(|(n, _)| n == name).count()
    }

    /// Every counter name seen, sorted.
    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.counts.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forgets everything recorded so far.
    pub fn reset(&self) {
        self.times.lock().clear();
        self.counts.lock().clear();
    }
}

impl TracerDriver for RecordingTracer {
    fn add_time(&self, name: &str, duration: Duration) {
        self.times.lock().push((name.to_string(), duration));
    }

    fn add_count(&self, name: &str, increment: u64) {
        *self.counts.lock().entry(name.to_string()).or_default() += increment;
    }
}

/// A sleeper that records requested durations and returns at once.
///
/// It still honours the call context, so a cancelled or expired call stops
/// at its next retry sleep.
#[derive(Debug, Default)]
pub struct CountingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl CountingSleeper {
    /// Creates a sleeper with no recorded sleeps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Number of sleeps requested so far.
    pub fn count(&self) -> usize {
        self.sleeps.lock().len()
    }

    /// Forgets recorded sleeps.
    pub fn reset(&self) {
        self.sleeps.lock().clear();
    }
}

impl RetrySleeper for CountingSleeper {
    fn sleep_for(&self, duration: Duration, ctx: &CallContext) -> ClientResult<()> {
        ctx.check()?;
        self.sleeps.lock().push(duration);
        Ok(())
    }
}
