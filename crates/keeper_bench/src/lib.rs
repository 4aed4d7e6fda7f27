//! Benchmark utilities.

#![warn(missing_docs)]

use keeper_client::{CallContext, ClientConfig, RetryNTimes};
use keeper_testkit::{fast_config, TestClient};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a payload that compresses well: short random runs repeated.
pub fn repetitive_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        let byte: u8 = rng.gen();
        let run = rng.gen_range(8..64).min(size - data.len());
        data.extend(std::iter::repeat(byte).take(run));
    }
    data
}

/// A client connected to an in-memory ensemble.
pub fn connected_client(config: ClientConfig) -> TestClient {
    TestClient::with_config(config, |b| {
        b.with_retry_policy(Arc::new(RetryNTimes::new(3, Duration::from_millis(1))))
    })
}

/// A client with the default test configuration.
pub fn default_client() -> TestClient {
    connected_client(fast_config())
}

/// A context without deadline.
pub fn background() -> CallContext {
    CallContext::background()
}
