//! Partial estimate replies: when the request advertises
//! `partial_estimate`, each sendsize reply chunk goes out immediately as
//! a PREP while the final REP still carries the whole reply.

use std::time::Duration;

use bh_security::{client, DriverKind, ReplyKind, RequestOptions};
use bh_test_utils::DispatcherHarness;

const SENDSIZE_SCRIPT: &str = "\
printf 'disk one 1024\\n'
sleep 1
printf 'disk two 2048\\n'
sleep 1
printf 'disk three 4096\\n'
";

/// Test: PREPs stream reply prefixes early; exactly one REP carries the
/// complete reply afterwards.
#[tokio::test]
async fn sendsize_streams_partial_replies() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("sendsize", SENDSIZE_SCRIPT);

    let (partial_tx, mut partial_rx) = tokio::sync::mpsc::channel::<String>(16);
    let opts = RequestOptions {
        ack_wait: Duration::from_secs(5),
        rep_wait: Duration::from_secs(30),
        connect_tries: 1,
        ..RequestOptions::default()
    };
    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE sendsize\nOPTIONS features=abc;partial_estimate;\n",
        &opts,
        Some(partial_tx),
    )
    .await
    .expect("sendsize request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    let full = "disk one 1024\ndisk two 2048\ndisk three 4096\n";
    assert!(reply.body.starts_with(full), "reply body: {:?}", reply.body);

    let mut partials = Vec::new();
    while let Ok(partial) = partial_rx.try_recv() {
        partials.push(partial);
    }
    assert!(
        partials.len() >= 2,
        "expected at least two PREPs, got {}",
        partials.len()
    );
    for partial in &partials {
        assert!(
            full.starts_with(partial.as_str()) || partial == &reply.body,
            "PREP is not a prefix of the reply: {partial:?}"
        );
    }
}

/// Test: without the capability, no PREP is ever sent.
#[tokio::test]
async fn no_partials_without_the_capability() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("sendsize", "printf 'disk one 1024\\n'\n");

    let (partial_tx, mut partial_rx) = tokio::sync::mpsc::channel::<String>(16);
    let opts = RequestOptions {
        ack_wait: Duration::from_secs(5),
        rep_wait: Duration::from_secs(20),
        connect_tries: 1,
        ..RequestOptions::default()
    };
    let (mut handle, reply) = client::request(
        DriverKind::BsdTcp,
        "127.0.0.1",
        &harness.client_config(),
        "SERVICE sendsize\nOPTIONS features=abc;\n",
        &opts,
        Some(partial_tx),
    )
    .await
    .expect("sendsize request should complete");
    handle.close();

    assert_eq!(reply.kind, ReplyKind::Rep);
    assert!(partial_rx.try_recv().is_err(), "unexpected PREP delivered");
}
