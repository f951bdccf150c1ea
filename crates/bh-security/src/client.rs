//! The client side of the request/reply protocol.
//!
//! One request walks the classic lifecycle:
//!
//! ```text
//! send REQ -> wait ACK -> wait REP -> send ACK -> done
//! ```
//!
//! An unanswered REQ is retransmitted a few times at ACK pace; an
//! unanswered reply wait falls back to a full resend a couple of times
//! (the peer may have rebooted) before giving up; an hour after the first
//! send the request is dead no matter what.  PREP packets deliver reply
//! prefixes early without stretching the remaining reply budget.  A NAK
//! is an application-level refusal, not a transport error: the caller
//! gets it as a reply.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use bh_protocol::{Packet, PacketKind};

use crate::config::{SecurityConfig, CONNECT_WAIT};
use crate::driver::{self, DriverKind, Handle};
use crate::error::{Result, SecurityError};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Retry and deadline knobs for one request.  The defaults mirror the
/// classic constants; tests compress them.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// REQ transmissions before the ACK wait gives up.
    pub req_tries: u32,
    /// How long to wait for the ACK of a REQ.
    pub ack_wait: Duration,
    /// How long to wait for the REP once the REQ was ACKed.
    pub rep_wait: Duration,
    /// Full REQ-resend cycles allowed after a reply-wait timeout.
    pub reset_tries: u32,
    /// Connection attempts before giving up, [`CONNECT_WAIT`] apart.
    pub connect_tries: u32,
    pub connect_wait: Duration,
    /// Hard deadline from the first transmission.
    pub drop_dead: Duration,
}

impl Default for RequestOptions {
    fn default() -> RequestOptions {
        RequestOptions {
            req_tries: 3,
            ack_wait: Duration::from_secs(10),
            rep_wait: Duration::from_secs(6 * 60 * 60),
            reset_tries: 2,
            connect_tries: 3,
            connect_wait: CONNECT_WAIT,
            drop_dead: Duration::from_secs(60 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The normal REQ/REP/ACK completion.
    Rep,
    /// The peer refused the request; the body says why.
    Nak,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: ReplyKind,
    pub body: String,
}

impl Reply {
    pub fn is_nak(&self) -> bool {
        self.kind == ReplyKind::Nak
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

enum State {
    SendReq,
    AckWait,
    RepWait,
}

/// Connect to `host` and drive `req_body` through the protocol.  Returns
/// the still-open handle (so the caller can connect any channels the
/// reply names) and the reply.  The result is produced exactly once.
pub async fn request(
    kind: DriverKind,
    host: &str,
    cfg: &SecurityConfig,
    req_body: &str,
    opts: &RequestOptions,
    partial_tx: Option<mpsc::Sender<String>>,
) -> Result<(Handle, Reply)> {
    let mut handle = connect_with_retry(kind, host, cfg, opts).await?;
    match exchange(&mut handle, req_body, opts, partial_tx).await {
        Ok(reply) => Ok((handle, reply)),
        Err(e) => {
            handle.close();
            Err(e)
        }
    }
}

async fn connect_with_retry(
    kind: DriverKind,
    host: &str,
    cfg: &SecurityConfig,
    opts: &RequestOptions,
) -> Result<Handle> {
    let tries = opts.connect_tries.max(1);
    let mut last = None;
    for attempt in 1..=tries {
        match driver::connect(kind, host, cfg).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                debug!(host, driver = kind.name(), attempt, error = %e, "connect attempt failed");
                last = Some(e);
                if attempt < tries {
                    tokio::time::sleep(opts.connect_wait).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| SecurityError::ConnectTimeout(host.to_owned())))
}

/// Run one request over an already-open handle.
pub async fn exchange(
    handle: &mut Handle,
    req_body: &str,
    opts: &RequestOptions,
    partial_tx: Option<mpsc::Sender<String>>,
) -> Result<Reply> {
    let req = Packet::req(req_body);
    let started = Instant::now();
    let drop_dead = started + opts.drop_dead;
    let mut req_tries = opts.req_tries;
    let mut reset_tries = opts.reset_tries;
    let mut state = State::SendReq;
    let mut rep_deadline = started + opts.rep_wait;

    loop {
        match state {
            State::SendReq => {
                handle.sendpkt(&req).await?;
                state = State::AckWait;
            }

            State::AckWait => match handle.recvpkt(Some(opts.ack_wait)).await? {
                None => {
                    if req_tries > 0 {
                        req_tries -= 1;
                        debug!(peer = handle.peer_name(), "REQ unacknowledged, resending");
                        state = State::SendReq;
                    } else {
                        warn!(peer = handle.peer_name(), "no ACK for request");
                        return Err(SecurityError::AckTimeout);
                    }
                }
                Some(pkt) => match pkt.kind {
                    PacketKind::Ack => {
                        rep_deadline = Instant::now() + opts.rep_wait;
                        state = State::RepWait;
                    }
                    PacketKind::Nak => {
                        return Ok(Reply { kind: ReplyKind::Nak, body: pkt.body });
                    }
                    PacketKind::Rep => {
                        handle.sendpkt(&Packet::ack()).await?;
                        return Ok(Reply { kind: ReplyKind::Rep, body: pkt.body });
                    }
                    PacketKind::Prep => {
                        deliver_partial(&partial_tx, &pkt.body).await;
                        rep_deadline = Instant::now() + opts.rep_wait;
                        state = State::RepWait;
                    }
                    PacketKind::Req => {
                        debug!(peer = handle.peer_name(), "unexpected REQ ignored");
                    }
                },
            },

            State::RepWait => {
                let now = Instant::now();
                if now >= drop_dead {
                    return Err(SecurityError::ReplyTimeout);
                }
                let budget = rep_deadline.min(drop_dead).saturating_duration_since(now);
                match handle.recvpkt(Some(budget)).await? {
                    None => {
                        if reset_tries > 0 && Instant::now() < drop_dead {
                            reset_tries -= 1;
                            req_tries = opts.req_tries;
                            debug!(peer = handle.peer_name(), "reply wait expired, restarting request");
                            state = State::SendReq;
                        } else {
                            warn!(peer = handle.peer_name(), "request timed out waiting for reply");
                            return Err(SecurityError::ReplyTimeout);
                        }
                    }
                    Some(pkt) => match pkt.kind {
                        PacketKind::Rep => {
                            handle.sendpkt(&Packet::ack()).await?;
                            return Ok(Reply { kind: ReplyKind::Rep, body: pkt.body });
                        }
                        PacketKind::Prep => {
                            // Partial replies spend the budget, never extend it.
                            deliver_partial(&partial_tx, &pkt.body).await;
                        }
                        PacketKind::Nak => {
                            return Ok(Reply { kind: ReplyKind::Nak, body: pkt.body });
                        }
                        PacketKind::Ack | PacketKind::Req => {
                            debug!(peer = handle.peer_name(), kind = %pkt.kind, "stray packet ignored");
                        }
                    },
                }
            }
        }
    }
}

async fn deliver_partial(partial_tx: &Option<mpsc::Sender<String>>, body: &str) {
    if let Some(tx) = partial_tx {
        let _ = tx.send(body.to_owned()).await;
    }
}
