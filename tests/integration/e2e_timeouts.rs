//! Client-side deadline behavior: drop-dead abort and ACK retry
//! exhaustion.

use std::time::{Duration, Instant};

use bh_security::{client, DriverKind, RequestOptions, SecurityError};
use bh_test_utils::DispatcherHarness;

/// Test: a hung service trips the drop-dead deadline; the submitter gets
/// exactly one completion, a ReplyTimeout.
#[tokio::test]
async fn drop_dead_aborts_a_hung_service() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("selfcheck", "sleep 30\n");

    let opts = RequestOptions {
        req_tries: 1,
        ack_wait: Duration::from_secs(2),
        rep_wait: Duration::from_secs(60),
        reset_tries: 2,
        connect_tries: 1,
        drop_dead: Duration::from_secs(2),
        ..RequestOptions::default()
    };
    let started = Instant::now();
    let err = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE selfcheck\n",
        &opts,
        None,
    )
    .await
    .expect_err("hung service must abort the request");

    assert!(matches!(err, SecurityError::ReplyTimeout), "unexpected error: {err}");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "drop-dead took {:?}",
        started.elapsed()
    );
}

/// Test: a peer that accepts the connection but never ACKs exhausts the
/// REQ retries and surfaces AckTimeout.
#[tokio::test]
async fn silent_peer_exhausts_req_tries() {
    // A listener that accepts and then ignores the connection entirely.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });

    let cfg = bh_security::SecurityConfig {
        require_reserved_peer_port: false,
        bind_reserved_port: false,
        service_port: addr.port(),
        ..bh_security::SecurityConfig::default()
    };
    let opts = RequestOptions {
        req_tries: 2,
        ack_wait: Duration::from_millis(300),
        connect_tries: 1,
        ..RequestOptions::default()
    };
    let started = Instant::now();
    let err = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &opts,
        None,
    )
    .await
    .expect_err("a mute peer must time out");

    assert!(matches!(err, SecurityError::AckTimeout), "unexpected error: {err}");
    // Three transmissions at 300 ms pace, well under the reply budget.
    assert!(started.elapsed() < Duration::from_secs(5));
    hold.abort();
}
