//! Sendbackup stream ordering: the dispatcher must not forward a single
//! DATA byte before the MESG channel has produced the
//! `sendbackup: info end` terminator.

use std::time::Duration;

use bh_security::{client, DriverKind, ReplyKind, RequestOptions, StreamRead};
use bh_protocol::ConnectLine;
use bh_test_utils::DispatcherHarness;

/// The fake sendbackup: announces DATA and MESG channels, then writes its
/// DATA payload *first* (into the pipe), and only later the MESG
/// terminator.  A dispatcher without the gate would forward DATA early.
const SENDBACKUP_SCRIPT: &str = "\
printf 'CONNECT DATA 50 MESG 51\\n'
exec >&-
printf 'DATA-BYTES' >&50
printf 'info something\\n' >&52
sleep 1
printf 'sendbackup: info end\\n' >&52
";

/// Test: DATA is held back until MESG carries the info-end marker, then
/// flows intact.
#[tokio::test]
async fn data_waits_for_info_end() {
    let harness = DispatcherHarness::start(DriverKind::BsdTcp, &[], |_| {}).await;
    harness.write_service("sendbackup", SENDBACKUP_SCRIPT);

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
        "SERVICE sendbackup\n",
        &opts,
        None,
    )
    .await
    .expect("sendbackup request should complete");
    assert_eq!(reply.kind, ReplyKind::Rep);

    // The REP names the wire ids the dispatcher allocated for us.
    let first_line = reply.body.lines().next().expect("CONNECT line");
    let connect = ConnectLine::parse(first_line)
        .expect("well-formed CONNECT line")
        .expect("reply starts with CONNECT");
    let data_id = connect
        .pairs
        .iter()
        .find(|(tag, _)| tag == "DATA")
        .map(|(_, id)| *id)
        .expect("DATA channel in CONNECT line");
    let mesg_id = connect
        .pairs
        .iter()
        .find(|(tag, _)| tag == "MESG")
        .map(|(_, id)| *id)
        .expect("MESG channel in CONNECT line");

    let data = handle.stream_client(data_id).expect("open DATA stream");
    let mesg = handle.stream_client(mesg_id).expect("open MESG stream");
    let (mut data_rx, _data_tx) = data.into_split();
    let (mut mesg_rx, _mesg_tx) = mesg.into_split();

    // While the MESG terminator has not been written, the DATA channel
    // must stay silent even though the service wrote its payload long ago.
    let early = tokio::time::timeout(Duration::from_millis(400), data_rx.read()).await;
    assert!(early.is_err(), "DATA byte forwarded before info end: {early:?}");

    // Drain MESG through the terminator.
    let mut mesg_text = String::new();
    while !mesg_text.contains("sendbackup: info end\n") {
        match mesg_rx.read().await.expect("MESG read") {
            StreamRead::Data(chunk) => mesg_text.push_str(&String::from_utf8_lossy(&chunk)),
            StreamRead::Eof => break,
        }
    }
    assert!(mesg_text.contains("sendbackup: info end\n"), "MESG: {mesg_text:?}");

    // Now the gate is open and the payload arrives, terminated by EOF.
    let mut data_bytes = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), data_rx.read())
            .await
            .expect("DATA should flow after info end")
            .expect("DATA read")
        {
            StreamRead::Data(chunk) => data_bytes.extend_from_slice(&chunk),
            StreamRead::Eof => break,
        }
    }
    assert_eq!(data_bytes, b"DATA-BYTES");
    handle.close();
}
