//! Retransmitted REQs must re-ACK the in-flight request, never spawn a
//! second service.

use std::time::Duration;

use bh_protocol::{Packet, PacketKind};
use bh_security::DriverKind;
use bh_test_utils::DispatcherHarness;

/// Test: a duplicate REQ (as after a lost ACK) is re-ACKed while the
/// original service keeps running; exactly one spawn happens and exactly
/// one REP completes the exchange.
#[tokio::test]
async fn duplicate_req_is_reacked_without_respawn() {
    let harness = DispatcherHarness::start(DriverKind::Bsd, &[], |_| {}).await;
    let count_file = harness.libexec.path().join("spawn-count");
    harness.write_service(
        "noop",
        &format!(
            "echo spawned >> {}\nsleep 1\nprintf 'OPTIONS features=abc;\\n'\n",
            count_file.display()
        ),
    );

    let cfg = harness.client_config();
    let mut handle = bh_security::connect(DriverKind::Bsd, "127.0.0.1", &cfg)
        .await
        .expect("connect");
    let req = Packet::req("SERVICE noop\n");

    handle.sendpkt(&req).await.expect("send REQ");
    let first = handle
        .recvpkt(Some(Duration::from_secs(5)))
        .await
        .expect("receive first ACK")
        .expect("first ACK before timeout");
    assert_eq!(first.kind, PacketKind::Ack);

    // Pretend the ACK was lost: transmit the same request again.
    handle.sendpkt(&req).await.expect("resend REQ");
    let second = handle
        .recvpkt(Some(Duration::from_secs(5)))
        .await
        .expect("receive re-ACK")
        .expect("re-ACK before timeout");
    assert_eq!(second.kind, PacketKind::Ack);

    // The single service run completes with a single REP.
    let rep = handle
        .recvpkt(Some(Duration::from_secs(10)))
        .await
        .expect("receive REP")
        .expect("REP before timeout");
    assert_eq!(rep.kind, PacketKind::Rep);
    assert_eq!(rep.body, "OPTIONS features=abc;\n");
    handle.sendpkt(&Packet::ack()).await.expect("final ACK");

    // Give the dispatcher a moment to reap, then count spawns.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let spawns = std::fs::read_to_string(&count_file).expect("spawn count file");
    assert_eq!(spawns.lines().count(), 1, "service spawned more than once");
    handle.close();
}
