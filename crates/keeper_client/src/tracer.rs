//! Per-operation timing and counting sinks.

use std::time::Duration;
use tracing::debug;

/// Records a duration sample and outcome counts per named operation.
///
/// A pure observer: the engine catches panics from it and never lets it
/// influence control flow.
pub trait TracerDriver: Send + Sync {
    /// Records how long one attempt of `name` took.
    fn add_time(&self, name: &str, duration: Duration);

    /// Adds `increment` to the counter `name`.
    fn add_count(&self, name: &str, increment: u64);
}

/// Discards every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl TracerDriver for NoopTracer {
    fn add_time(&self, _name: &str, _duration: Duration) {}

    fn add_count(&self, _name: &str, _increment: u64) {}
}

/// Emits samples as `tracing` debug records under the `keeper::trace` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTracer;

impl TracerDriver for LoggingTracer {
    fn add_time(&self, name: &str, duration: Duration) {
        debug!(target: "keeper::trace", op = name, elapsed_us = duration.as_micros() as u64, "time");
    }

    fn add_count(&self, name: &str, increment: u64) {
        debug!(target: "keeper::trace", counter = name, increment, "count");
    }
}
