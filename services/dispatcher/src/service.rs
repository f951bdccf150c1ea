//! One active service: the per-request state machine.
//!
//! Lifecycle of an accepted request:
//!
//! 1. authorize the peer; NAK and close on refusal
//! 2. parse the SERVICE line, check the allow-list, spawn the service
//! 3. ACK the request and feed the body to the service's stdin
//! 4. collect the reply from its stdout (duplicate REQs are re-ACKed;
//!    sendsize forwards reply chunks early as PREPs when asked to)
//! 5. translate the CONNECT line into wire stream ids, send the REP, and
//!    retry it until the server ACKs
//! 6. relay the data channels between the service's pipes and the
//!    network streams; for sendbackup, hold the DATA channel until the
//!    MESG channel has said `sendbackup: info end`

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use bh_protocol::body::{has_option, split_security_user, strip_kencrypt};
use bh_protocol::{ConnectLine, Packet, PacketKind, ServiceRequest, NETWORK_BLOCK_BYTES};
use bh_security::hostauth::{self, Peer};
use bh_security::{Handle, StreamReader, StreamRead, StreamWriter, SecurityError};

use crate::spawn::{spawn_service, DataPipes};
use crate::DispatcherContext;

/// The string the MESG channel must produce before DATA may flow.
const INFO_END: &[u8] = b"sendbackup: info end\n";

/// Grace period after stdout EOF for a quick exit whose status should
/// make it into the reply.  Streaming services outlive this and are
/// reaped after the relay instead.
const CHILD_EXIT_GRACE: Duration = Duration::from_millis(200);

/// How long to wait for the service to exit once its work is done.
const CHILD_REAP_WAIT: Duration = Duration::from_secs(10);

/// Channel index of sendbackup's DATA and MESG streams.
const DATA_CHANNEL: usize = 0;
const MESG_CHANNEL: usize = 1;

// ---------------------------------------------------------------------------
// Allow-list
// ---------------------------------------------------------------------------

/// The full service catalog with its default activation state.
const SERVICES: [(&str, bool); 7] = [
    ("noop", true),
    ("sendsize", true),
    ("sendbackup", true),
    ("selfcheck", true),
    ("amindexd", false),
    ("amidxtaped", false),
    ("amdumpd", false),
];

/// Services the `amdump` pseudo-service stands for.
const AMDUMP_SET: [&str; 4] = ["noop", "sendsize", "sendbackup", "selfcheck"];

#[derive(Debug, Clone)]
pub struct ServiceTable {
    active: HashMap<&'static str, bool>,
}

impl Default for ServiceTable {
    fn default() -> ServiceTable {
        ServiceTable { active: SERVICES.iter().copied().collect() }
    }
}

impl ServiceTable {
    /// Apply positional CLI toggles.  Unknown names are fatal.
    pub fn apply_cli(&mut self, names: &[String]) -> Result<(), String> {
        for name in names {
            if name == "amdump" {
                for svc in AMDUMP_SET {
                    self.active.insert(svc, true);
                }
                continue;
            }
            let Some(entry) = SERVICES.iter().find(|(svc, _)| svc == name) else {
                return Err(format!("{name}: invalid service"));
            };
            self.active.insert(entry.0, true);
        }
        Ok(())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.get(name).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve one accepted request to completion.  Never panics the process;
/// all failure paths NAK and/or log.
pub async fn handle_request(ctx: Arc<DispatcherContext>, mut handle: Handle, req: Packet) {
    let peer = handle.peer_name().to_owned();
    if let Err(e) = run(&ctx, &mut handle, req).await {
        warn!(peer = %peer, driver = %ctx.auth_name, error = %e, "request failed");
    }
    handle.close();
}

async fn nak(handle: &mut Handle, text: &str) {
    if let Err(e) = handle.sendpkt(&Packet::nak(text)).await {
        debug!(error = %e, "could not deliver NAK");
    }
}

async fn run(
    ctx: &DispatcherContext,
    handle: &mut Handle,
    req: Packet,
) -> Result<(), SecurityError> {
    // The datagram family authenticates the SECURITY USER line before the
    // request ever surfaces here; stream requests carry no user line and
    // assert the local login user.
    let (remote_user, rest) = match split_security_user(&req.body) {
        Some((user, rest)) => (user, rest),
        None => ("", req.body.as_str()),
    };

    let service_req = match ServiceRequest::parse(rest) {
        Ok(r) => r,
        Err(e) => {
            nak(handle, &format!("ERROR {e}\n")).await;
            return Ok(());
        }
    };
    let service = service_req.service.clone();

    let peer_addr = handle
        .peer_addr()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    if let Err(reason) = hostauth::check(
        &ctx.security,
        Peer {
            hostname: handle.peer_name(),
            addr: peer_addr,
            remote_user,
            service: &service,
        },
    ) {
        warn!(
            peer = handle.peer_name(),
            driver = %ctx.auth_name,
            service = %service,
            reason = %reason,
            "peer not authorized"
        );
        nak(handle, &format!("ERROR {reason}\n")).await;
        return Ok(());
    }

    if !ctx.services.is_active(&service) {
        warn!(peer = handle.peer_name(), service = %service, "service not allowed");
        nak(handle, &format!("ERROR unknown service: {service}\n")).await;
        return Ok(());
    }

    let path = ctx.config.general.libexec_dir.join(&service);
    let mut spawned = match spawn_service(&path, &ctx.auth_name, handle.peer_name()) {
        Ok(s) => s,
        Err(e) => {
            warn!(service = %service, error = %e, "could not spawn service");
            nak(handle, &format!("ERROR service {service} failed to start\n")).await;
            return Ok(());
        }
    };
    info!(
        peer = handle.peer_name(),
        service = %service,
        pid = spawned.pid,
        "service started"
    );

    // s_sendack: acknowledge, hand the request over, collect the reply.
    handle.sendpkt(&Packet::ack()).await?;

    let stdin_payload = if service_req.args.is_empty() {
        service_req.rest.clone()
    } else {
        format!("{}\n{}", service_req.args, service_req.rest)
    };
    let mut stdin = spawned.stdin;
    if let Err(e) = stdin.write_all(stdin_payload.as_bytes()).await {
        debug!(service = %service, error = %e, "service did not read its request");
    }
    drop(stdin); // EOF tells the service the request is complete

    let stderr = spawned.stderr;
    let stderr_service = service.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(service = %stderr_service, line = %line, "service stderr");
        }
    });

    let send_partial = service == "sendsize" && has_option(&req.body, "partial_estimate");
    let reply = match collect_reply(ctx, handle, &mut spawned.stdout, send_partial).await {
        Err(e) => {
            // The requester is gone; no point letting the service run on.
            let _ = spawned.child.start_kill();
            let _ = spawned.child.wait().await;
            stderr_task.abort();
            return Err(e);
        }
        Ok(Some(reply)) => reply,
        Ok(None) => {
            // Reply timeout: the service gets killed, the server a NAK.
            nak(handle, "ERROR timeout on reply pipe\n").await;
            let _ = spawned.child.start_kill();
            let _ = spawned.child.wait().await;
            stderr_task.abort();
            return Ok(());
        }
    };

    // Bounded wait for the exit status so a quick failure makes it into
    // the REP; a service that lives on to feed its channels is reaped
    // after the relay.
    let mut reply = reply;
    let mut reaped = false;
    match tokio::time::timeout(CHILD_EXIT_GRACE, spawned.child.wait()).await {
        Ok(Ok(status)) => {
            use std::os::unix::process::ExitStatusExt;
            reaped = true;
            if let Some(code) = status.code() {
                if code != 0 {
                    reply.push_str(&format!(
                        "ERROR service {service} failed: pid {} exited with code {code}\n",
                        spawned.pid
                    ));
                }
            } else if let Some(signal) = status.signal() {
                reply.push_str(&format!(
                    "ERROR service {service} failed: pid {} killed by signal {signal}\n",
                    spawned.pid
                ));
            }
        }
        Ok(Err(e)) => warn!(service = %service, error = %e, "could not reap service"),
        Err(_) => debug!(service = %service, pid = spawned.pid, "service still running after reply"),
    }

    // s_processrep: translate the CONNECT line into wire stream ids.
    let (kencrypt, body) = strip_kencrypt(&reply);
    if kencrypt {
        // No carried driver implements payload encryption; the marker is
        // forwarded so the server can make its own call.
        debug!(service = %service, "service requested kencrypt");
    }
    let (first_line, remainder) = match body.split_once('\n') {
        Some((f, r)) => (f, r),
        None => (body, ""),
    };
    let mut channels: Vec<(usize, StreamReader, StreamWriter)> = Vec::new();
    let mapped_body = match ConnectLine::parse(first_line) {
        Ok(Some(connect)) => {
            let mut wire = ConnectLine::default();
            for (tag, local_id) in connect.pairs {
                let Some(index) = ConnectLine::local_channel_index(local_id) else {
                    warn!(service = %service, tag = %tag, local_id, "CONNECT id outside the data-channel window");
                    continue;
                };
                match handle.stream_server() {
                    Ok(stream) => {
                        wire.pairs.push((tag, stream.id()));
                        let (reader, writer) = stream.into_split();
                        channels.push((index, reader, writer));
                    }
                    Err(e) => {
                        warn!(service = %service, tag = %tag, error = %e, "cannot open stream for channel");
                    }
                }
            }
            format!("{}\n{}", wire.format(), remainder)
        }
        Ok(None) => body.to_owned(),
        Err(e) => {
            warn!(service = %service, error = %e, "malformed CONNECT line forwarded verbatim");
            body.to_owned()
        }
    };
    let rep_body = if kencrypt { format!("KENCRYPT\n{mapped_body}") } else { mapped_body };

    // s_sendrep / s_ackwait: retry the REP until the server ACKs it.
    let acked = send_rep(ctx, handle, &Packet::rep(rep_body)).await?;
    if acked && !channels.is_empty() {
        relay_channels(&service, &mut spawned.data, channels).await;
    }

    if !reaped {
        if tokio::time::timeout(CHILD_REAP_WAIT, spawned.child.wait())
            .await
            .is_err()
        {
            warn!(service = %service, pid = spawned.pid, "service would not exit, killing it");
            let _ = spawned.child.start_kill();
            let _ = spawned.child.wait().await;
        }
    }
    stderr_task.abort();
    info!(service = %service, pid = spawned.pid, "service finished");
    Ok(())
}

// ---------------------------------------------------------------------------
// Reply collection (s_repwait)
// ---------------------------------------------------------------------------

/// Accumulate the service's stdout until EOF.  Returns `None` on reply
/// timeout.  Duplicate REQs are re-ACKed in place.
async fn collect_reply(
    ctx: &DispatcherContext,
    handle: &mut Handle,
    stdout: &mut tokio::process::ChildStdout,
    send_partial: bool,
) -> Result<Option<String>, SecurityError> {
    enum Event {
        Read(std::io::Result<usize>),
        Packet(Result<Option<Packet>, SecurityError>),
        Timeout,
    }

    let mut reply: Vec<u8> = Vec::with_capacity(NETWORK_BLOCK_BYTES);
    let mut buf = vec![0u8; NETWORK_BLOCK_BYTES];
    let deadline = Instant::now() + ctx.config.general.rep_timeout;

    loop {
        let event = tokio::select! {
            read = stdout.read(&mut buf) => Event::Read(read),
            pkt = handle.recvpkt(None) => Event::Packet(pkt),
            _ = tokio::time::sleep_until(deadline) => Event::Timeout,
        };
        match event {
            Event::Read(Ok(0)) => break,
            Event::Read(Ok(n)) => {
                reply.extend_from_slice(&buf[..n]);
                if send_partial {
                    let so_far = String::from_utf8_lossy(&reply).into_owned();
                    handle.sendpkt(&Packet::prep(so_far)).await?;
                }
            }
            Event::Read(Err(e)) => {
                warn!(error = %e, "reply pipe read failed");
                break;
            }
            Event::Packet(Ok(Some(pkt))) if pkt.kind == PacketKind::Req => {
                // The server did not see our ACK; repeat it without
                // spawning anything.
                debug!(peer = handle.peer_name(), "duplicate REQ, re-ACKing");
                handle.sendpkt(&Packet::ack()).await?;
            }
            Event::Packet(Ok(Some(pkt))) => {
                debug!(kind = %pkt.kind, "unexpected packet while collecting reply");
            }
            Event::Packet(Ok(None)) => {}
            Event::Packet(Err(e)) => return Err(e),
            Event::Timeout => {
                warn!(peer = handle.peer_name(), "timeout waiting for service reply");
                return Ok(None);
            }
        }
    }

    Ok(Some(String::from_utf8_lossy(&reply).into_owned()))
}

// ---------------------------------------------------------------------------
// REP delivery (s_sendrep / s_ackwait)
// ---------------------------------------------------------------------------

async fn send_rep(
    ctx: &DispatcherContext,
    handle: &mut Handle,
    rep: &Packet,
) -> Result<bool, SecurityError> {
    let mut tries = ctx.config.general.rep_tries;
    loop {
        handle.sendpkt(rep).await?;
        match handle.recvpkt(Some(ctx.config.general.ack_timeout)).await? {
            None => {
                tries -= 1;
                if tries == 0 {
                    warn!(peer = handle.peer_name(), "no ACK for our REP");
                    return Ok(false);
                }
                debug!(peer = handle.peer_name(), "REP unacknowledged, resending");
            }
            Some(pkt) => match pkt.kind {
                PacketKind::Ack => return Ok(true),
                // A late duplicate REQ means the REP got lost too.
                PacketKind::Req => {
                    debug!(peer = handle.peer_name(), "duplicate REQ, resending REP");
                }
                other => {
                    warn!(peer = handle.peer_name(), kind = %other, "unexpected packet awaiting ACK");
                    return Ok(false);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Channel relay
// ---------------------------------------------------------------------------

/// Pump every connected channel between the service's pipes and the
/// network until both directions have seen EOF.
async fn relay_channels(
    service: &str,
    pipes: &mut [Option<DataPipes>],
    channels: Vec<(usize, StreamReader, StreamWriter)>,
) {
    // Sendbackup's DATA channel stays quiet until MESG produced the
    // info-end marker; everything else starts open.
    let gated = service == "sendbackup";
    let (gate_tx, gate_rx) = watch::channel(!gated);

    let mut tasks = JoinSet::new();
    for (index, reader, writer) in channels {
        let Some(DataPipes { from_child, to_child }) = pipes
            .get_mut(index)
            .and_then(|slot| slot.take())
        else {
            warn!(service, index, "channel has no pipe pair");
            continue;
        };

        let scan_info_end = gated && index == MESG_CHANNEL;
        let hold_until_gate = gated && index == DATA_CHANNEL;
        let child_to_net_gate = gate_rx.clone();
        let info_end_gate = gate_tx.clone();

        tasks.spawn(child_to_net(
            index,
            from_child,
            writer,
            hold_until_gate.then_some(child_to_net_gate),
            scan_info_end.then_some(info_end_gate),
        ));
        tasks.spawn(net_to_child(index, reader, to_child));
    }
    drop(gate_tx);

    while tasks.join_next().await.is_some() {}
}

/// Child pipe -> network stream; closes the stream at pipe EOF.
async fn child_to_net(
    index: usize,
    mut from_child: tokio::net::unix::pipe::Receiver,
    mut writer: StreamWriter,
    gate: Option<watch::Receiver<bool>>,
    info_end_tx: Option<watch::Sender<bool>>,
) {
    if let Some(mut gate) = gate {
        loop {
            if *gate.borrow() {
                break;
            }
            if gate.changed().await.is_err() {
                // The marker never arrived; this channel stays shut.
                debug!(index, "gate closed without info end, dropping channel");
                let _ = writer.close().await;
                return;
            }
        }
        debug!(index, "data channel released");
    }

    let mut window: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; NETWORK_BLOCK_BYTES];
    loop {
        match from_child.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(tx) = &info_end_tx {
                    if scan_for_marker(&mut window, &buf[..n], INFO_END) {
                        let _ = tx.send(true);
                    }
                }
                if let Err(e) = writer.write(&buf[..n]).await {
                    debug!(index, error = %e, "network write failed");
                    return;
                }
            }
            Err(e) => {
                debug!(index, error = %e, "child pipe read failed");
                break;
            }
        }
    }
    let _ = writer.close().await;
}

/// Network stream -> child pipe; closes the pipe at stream EOF.
async fn net_to_child(
    index: usize,
    mut reader: StreamReader,
    mut to_child: tokio::net::unix::pipe::Sender,
) {
    loop {
        match reader.read().await {
            Ok(StreamRead::Data(chunk)) => {
                if let Err(e) = to_child.write_all(&chunk).await {
                    debug!(index, error = %e, "child pipe write failed");
                    return;
                }
            }
            Ok(StreamRead::Eof) => break,
            Err(e) => {
                debug!(index, error = %e, "network read failed");
                break;
            }
        }
    }
}

/// Rolling scan for `needle` across chunk boundaries.  `window` keeps the
/// tail of the previous chunks.
fn scan_for_marker(window: &mut Vec<u8>, chunk: &[u8], needle: &[u8]) -> bool {
    let mut haystack = std::mem::take(window);
    haystack.extend_from_slice(chunk);
    let found = haystack
        .windows(needle.len())
        .any(|candidate| candidate == needle);
    let keep = haystack.len().saturating_sub(needle.len() - 1);
    *window = haystack.split_off(keep);
    found
}
