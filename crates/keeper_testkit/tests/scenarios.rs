//! End-to-end scenarios against the in-memory ensemble.

use keeper_client::{
    CallContext, CancelToken, Client, ClientError, ConnectionState, CreateMode, CreateOptions,
    KeeperError, RetryNTimes,
};
use keeper_testkit::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn ctx() -> CallContext {
    CallContext::with_timeout(WAIT)
}

#[test]
fn create_ephemeral_when_connected() {
    init_test_logging();
    let fx = TestClient::connected();

    let path = fx
        .create(
            &ctx(),
            "/a",
            b"data",
            &CreateOptions::new().with_mode(CreateMode::Ephemeral),
        )
        .unwrap();

    assert_eq!(path, "/a");
    assert_eq!(fx.tracer.count("create.success"), 1);
    assert_eq!(fx.tracer.count("create.retry"), 0);
    assert_eq!(fx.tracer.timings("create"), 1);
    assert_eq!(fx.outstanding_watches(), 0);
    assert_eq!(
        fx.ensemble.stat("/a").unwrap().ephemeral_owner,
        fx.session_id().0
    );
}

#[test]
fn read_during_suspension_gap_is_transparent() {
    init_test_logging();
    let fx = TestClient::connected();
    fx.ensemble.put("/a", b"v1");
    let expected = fx.get(&ctx(), "/a").unwrap();

    let session = fx.session_id();
    fx.ensemble.disconnect(session);
    fx.wait_for(ConnectionState::Suspended);

    let client = fx.client.clone();
    let reader = thread::spawn(move || client.get(&CallContext::with_timeout(WAIT), "/a"));
    thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());

    fx.ensemble.reconnect(session);
    let got = reader.join().unwrap().unwrap();

    assert_eq!(got, expected);
    assert_eq!(fx.session_id(), session);
    assert_eq!(fx.tracer.count("get.failure"), 0);
}

#[test]
fn retries_exhausted_after_three_attempts() {
    init_test_logging();
    let fx = TestClient::connected();
    let calls = fx.ensemble.call_count();
    fx.ensemble.fail_next(KeeperError::ConnectionLoss, 3);

    let err = fx.exists(&ctx(), "/a").unwrap_err();

    assert_eq!(
        err,
        ClientError::RetriesExhausted {
            attempts: 3,
            source: KeeperError::ConnectionLoss
        }
    );
    assert_eq!(fx.ensemble.call_count() - calls, 3);
    assert_eq!(fx.sleeper.count(), 2);
    assert_eq!(fx.tracer.count("exists.retry"), 2);
    assert_eq!(fx.tracer.count("exists.failure"), 1);
}

#[test]
fn lost_fails_fast_without_attempts() {
    init_test_logging();
    let config = fast_config().with_redial_backoff(Duration::from_secs(30));
    let fx = TestClient::with_config(config, |b| {
        b.with_retry_policy(Arc::new(RetryNTimes::new(2, Duration::from_millis(1))))
    });

    let dials = fx.ensemble.dial_count();
    fx.ensemble.fail_next_dials(KeeperError::ConnectionLoss, 3);
    fx.ensemble.expire_session(fx.session_id());
    fx.wait_for(ConnectionState::Lost);
    assert!(eventually(|| fx.ensemble.dial_count() == dials + 3));

    let calls = fx.ensemble.call_count();
    let sleeps = fx.sleeper.count();

    assert_eq!(fx.get(&ctx(), "/a"), Err(ClientError::ConnectionLost));
    assert_eq!(fx.ensemble.call_count(), calls);
    assert_eq!(fx.sleeper.count(), sleeps);
    assert_eq!(fx.state(), ConnectionState::Lost);
}

#[test]
fn expiry_while_suspended_flushes_blocked_call() {
    init_test_logging();
    let fx = TestClient::connected();
    fx.ensemble.put("/a", b"v1");
    let first = fx.session_id();
    fx.ensemble.disconnect(first);
    fx.wait_for(ConnectionState::Suspended);

    let calls = fx.ensemble.call_count();
    let client = fx.client.clone();
    let blocked = thread::spawn(move || client.get(&CallContext::with_timeout(WAIT), "/a"));
    thread::sleep(Duration::from_millis(30));
    assert!(!blocked.is_finished());

    fx.ensemble.expire_session(first);

    assert_eq!(blocked.join().unwrap(), Err(ClientError::ConnectionLost));
    assert_eq!(fx.ensemble.call_count(), calls);
    fx.wait_for(ConnectionState::Connected);
    assert_ne!(fx.session_id(), first);
}

#[test]
fn dropping_the_client_ends_its_session() {
    init_test_logging();
    let ensemble = InMemoryEnsemble::new();
    let client = Client::builder(fast_config(), Arc::new(ensemble.clone())).build();
    client.start().unwrap();
    client.block_until_connected(WAIT).unwrap();
    assert_eq!(ensemble.live_sessions().len(), 1);

    drop(client);

    assert!(eventually(|| ensemble.live_sessions().is_empty()));
}

#[test]
fn domain_errors_are_not_retried() {
    let fx = TestClient::connected();
    let calls = fx.ensemble.call_count();

    assert_eq!(
        fx.get(&ctx(), "/missing"),
        Err(ClientError::Domain(KeeperError::NoNode))
    );
    assert_eq!(fx.ensemble.call_count() - calls, 1);
    assert_eq!(fx.sleeper.count(), 0);
}

#[test]
fn transient_failure_recovers_within_budget() {
    let fx = TestClient::connected();
    fx.ensemble.put("/a", b"v");
    fx.ensemble.fail_next(KeeperError::OperationTimeout, 2);

    let (data, _) = fx.get(&ctx(), "/a").unwrap();

    assert_eq!(data, b"v");
    assert_eq!(fx.sleeper.count(), 2);
    assert_eq!(fx.tracer.count("get.retry"), 2);
    assert_eq!(fx.tracer.count("get.success"), 1);
}

#[test]
fn suspended_wait_is_bounded_by_connection_timeout() {
    let config = fast_config().with_connection_timeout(Duration::from_millis(100));
    let fx = TestClient::with_config(config, |b| b);
    fx.ensemble.disconnect(fx.session_id());
    fx.wait_for(ConnectionState::Suspended);

    assert_eq!(
        fx.exists(&CallContext::background(), "/a"),
        Err(ClientError::SuspendedTimeout)
    );
    assert_eq!(
        fx.exists(&CallContext::with_timeout(Duration::from_millis(30)), "/a"),
        Err(ClientError::DeadlineExceeded)
    );
}

#[test]
fn cancellation_wakes_blocked_call() {
    let fx = TestClient::connected();
    fx.ensemble.disconnect(fx.session_id());
    fx.wait_for(ConnectionState::Suspended);

    let token = CancelToken::new();
    let call_ctx = CallContext::with_timeout(WAIT).cancelled_by(token.clone());
    let client = fx.client.clone();
    let blocked = thread::spawn(move || client.exists(&call_ctx, "/a"));

    thread::sleep(Duration::from_millis(30));
    token.cancel();

    assert_eq!(blocked.join().unwrap(), Err(ClientError::Cancelled));
}

#[test]
fn suspended_max_degrades_to_lost() {
    let config = fast_config().with_suspended_max(Duration::from_millis(100));
    let fx = TestClient::with_config(config, |b| b);
    let (_, events) = fx.subscribe_state();
    let first = fx.session_id();

    fx.ensemble.disconnect(first);

    let seen = collect_states(&events, ConnectionState::Connected);
    assert_eq!(
        seen,
        [
            ConnectionState::Suspended,
            ConnectionState::Lost,
            ConnectionState::Connected
        ]
    );
    assert_ne!(fx.session_id(), first);
    assert!(!fx.ensemble.live_sessions().contains(&first));
}

#[test]
fn close_fails_waiters() {
    let fx = TestClient::connected();
    fx.ensemble.disconnect(fx.session_id());
    fx.wait_for(ConnectionState::Suspended);

    let client = fx.client.clone();
    let blocked = thread::spawn(move || client.exists(&CallContext::with_timeout(WAIT), "/a"));
    thread::sleep(Duration::from_millis(30));
    fx.close();

    assert_eq!(blocked.join().unwrap(), Err(ClientError::Closed));
    assert!(fx.is_closed());
    assert!(eventually(|| fx.ensemble.live_sessions().is_empty()));
    assert_eq!(fx.exists(&ctx(), "/a"), Err(ClientError::Closed));
}
