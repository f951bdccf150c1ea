//! End-to-end request/reply over the datagram and TCP drivers.
//!
//! A real dispatcher runs in-process with a fake `noop` service; the
//! client machine drives the full REQ/ACK/REP/ACK exchange against it.

use std::time::Duration;

use bh_security::{client, DriverKind, ReplyKind, RequestOptions};
use bh_test_utils::DispatcherHarness;

const NOOP_SCRIPT: &str = "printf 'OPTIONS features=abc;\\n'\n";

fn quick_options() -> RequestOptions {
    RequestOptions {
        ack_wait: Duration::from_secs(5),
        rep_wait: Duration::from_secs(20),
        connect_tries: 1,
        ..RequestOptions::default()
    }
}

/// Test: the happy path over UDP: REQ in, OPTIONS echo back.
#[tokio::test]
async fn noop_over_udp() {
    let harness = DispatcherHarness::start(DriverKind::Bsd, &[], |_| {}).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let (mut handle, reply) = client::request(
        DriverKind::Bsd,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect("request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    assert_eq!(reply.body, "OPTIONS features=abc;\n");
}

/// Test: the happy path over TCP.
#[tokio::test]
async fn noop_over_tcp() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect("request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    assert_eq!(reply.body, "OPTIONS features=abc;\n");
}

/// Test: two concurrent requests multiplex over the stream driver
/// without mixing up replies.
#[tokio::test]
async fn concurrent_requests_stay_separate() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("noop", NOOP_SCRIPT);
    harness.write_service("selfcheck", "printf 'OK selfcheck\\n'\n");

    let cfg = harness.client_config();
    let noop_opts = quick_options();
    let noop = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &noop_opts,
        None,
    );
    let selfcheck_opts = quick_options();
    let selfcheck = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &cfg,
        "SERVICE selfcheck\n",
        &selfcheck_opts,
        None,
    );
    let (noop, selfcheck) = tokio::join!(noop, selfcheck);

    let (mut h1, noop) = noop.expect("noop should complete");
    let (mut h2, selfcheck) = selfcheck.expect("selfcheck should complete");
    h1.close();
    h2.close();
    assert_eq!(noop.body, "OPTIONS features=abc;\n");
    assert_eq!(selfcheck.body, "OK selfcheck\n");
}

/// Test: a service outside the allow-list draws a NAK, not a spawn.
#[tokio::test]
async fn disabled_service_gets_nak() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("amindexd", NOOP_SCRIPT);

    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE amindexd\n",
        &quick_options(),
        None,
    )
    .await
    .expect("exchange should complete with a NAK");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Nak);
    assert!(reply.body.contains("unknown service"), "body: {}", reply.body);
}

/// Test: a request with no SERVICE line draws a NAK.
#[tokio::test]
async fn malformed_request_gets_nak() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;

    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "OPTIONS nothing;\n",
        &quick_options(),
        None,
    )
    .await
    .expect("exchange should complete with a NAK");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Nak);
}

/// Test: a failing service still replies, with the exit status appended.
#[tokio::test]
async fn nonzero_exit_appends_error_line() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("selfcheck", "printf 'partial output\\n'\nexit 3\n");

    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE selfcheck\n",
        &quick_options(),
        None,
    )
    .await
    .expect("request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    assert!(reply.body.starts_with("partial output\n"), "body: {}", reply.body);
    assert!(
        reply.body.contains("exited with code 3"),
        "missing exit status note: {}",
        reply.body
    );
}
