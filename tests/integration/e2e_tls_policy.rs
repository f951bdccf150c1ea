//! TLS driver policy: handshake, CA verification, fingerprint
//! allow-lists.

use std::time::Duration;

use bh_security::{client, DriverKind, ReplyKind, RequestOptions, SecurityError};
use bh_test_utils::{DispatcherHarness, TestTls};

const NOOP_SCRIPT: &str = "printf 'OPTIONS features=abc;\\n'\n";

fn quick_options() -> RequestOptions {
    RequestOptions {
        ack_wait: Duration::from_secs(5),
        rep_wait: Duration::from_secs(20),
        connect_tries: 1,
        ..RequestOptions::default()
    }
}

async fn tls_harness(tls: &TestTls) -> DispatcherHarness {
    let cert = tls.cert_file.clone();
    let key = tls.key_file.clone();
    let ca = tls.ca_file.clone();
    DispatcherHarness::start(DriverKind::Ssl, &[], move |cfg| {
        cfg.tls.cert_file = Some(cert);
        cfg.tls.key_file = Some(key);
        cfg.tls.ca_file = Some(ca);
    })
    .await
}

/// Test: mutual TLS with a shared CA completes the exchange.
#[tokio::test]
async fn mutual_tls_happy_path() {
    let tls = TestTls::generate("localhost");
    let harness = tls_harness(&tls).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let (mut handle, reply) = client::request(
        DriverKind::Ssl,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect("tls request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    assert_eq!(reply.body, "OPTIONS features=abc;\n");
}

/// Test: a fingerprint allow-list that names the peer's SHA-1 passes.
#[tokio::test]
async fn matching_fingerprint_accepted() {
    let tls = TestTls::generate("localhost");
    let harness = tls_harness(&tls).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let fingerprints = tls.write_fingerprint_file(&[tls.sha1_line()]);
    let mut cfg = harness.client_config();
    cfg.tls.fingerprint_file = Some(fingerprints);

    let (mut handle, reply) = client::request(
        DriverKind::Ssl,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect("fingerprinted request should complete");
    handle.close();
    assert_eq!(reply.kind, ReplyKind::Rep);
}

/// Test: a fingerprint file without the peer's print rejects the
/// connection before any packet flows.
#[tokio::test]
async fn mismatched_fingerprint_rejected() {
    let tls = TestTls::generate("localhost");
    let harness = tls_harness(&tls).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let fingerprints = tls.write_fingerprint_file(&[tls.mismatching_sha1_line()]);
    let mut cfg = harness.client_config();
    cfg.tls.fingerprint_file = Some(fingerprints);

    let err = client::request(
        DriverKind::Ssl,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect_err("mismatched fingerprint must fail");
    assert!(
        matches!(err, SecurityError::FingerprintRejected(_)),
        "unexpected error: {err}"
    );
}

/// Test: a client trusting a different CA refuses the server.
#[tokio::test]
async fn unrelated_ca_rejected() {
    let tls = TestTls::generate("localhost");
    let other = TestTls::generate("localhost");
    let harness = tls_harness(&tls).await;
    harness.write_service("noop", NOOP_SCRIPT);

    let mut cfg = harness.client_config();
    cfg.tls.ca_file = Some(other.ca_file.clone());

    let err = client::request(
        DriverKind::Ssl,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &quick_options(),
        None,
    )
    .await
    .expect_err("wrong CA must fail the handshake");
    assert!(
        matches!(err, SecurityError::PeerUnauthenticated(_)),
        "unexpected error: {err}"
    );
}

/// Test: the dispatcher applies the fingerprint allow-list to the client
/// certificate as well; a rejected client never completes an exchange.
#[tokio::test]
async fn server_side_fingerprint_enforced() {
    let tls = TestTls::generate("localhost");
    let fingerprints = tls.write_fingerprint_file(&[tls.mismatching_sha1_line()]);
    let cert = tls.cert_file.clone();
    let key = tls.key_file.clone();
    let ca = tls.ca_file.clone();
    let harness = DispatcherHarness::start(DriverKind::Ssl, &[], move |cfg| {
        cfg.tls.cert_file = Some(cert);
        cfg.tls.key_file = Some(key);
        cfg.tls.ca_file = Some(ca);
        cfg.tls.fingerprint_file = Some(fingerprints);
    })
    .await;
    harness.write_service("noop", NOOP_SCRIPT);

    let opts = RequestOptions {
        req_tries: 0,
        ack_wait: Duration::from_millis(500),
        connect_tries: 1,
        ..quick_options()
    };
    // Only the dispatcher applies the allow-list here.
    let mut cfg = harness.client_config();
    cfg.tls.fingerprint_file = None;
    let result = client::request(
        DriverKind::Ssl,
        "127.0.0.1",
        &cfg,
        "SERVICE noop\n",
        &opts,
        None,
    )
    .await;
    assert!(result.is_err(), "rejected client must not complete an exchange");
}
