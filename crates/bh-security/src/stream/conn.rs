//! The shared connection under every stream-driver handle.
//!
//! One connection runs two tasks: a writer draining a frame queue (all
//! channel writes are serialized through it) and a reader that decodes
//! frames and demultiplexes them:
//!
//! - channel 0 payloads are packets, routed by the handle token in their
//!   header; an unknown token on an accepting connection synthesizes a new
//!   handle and delivers `(handle, packet)` to the acceptor
//! - non-zero channels route to the per-channel queue of the owning
//!   stream; the queue holds at most one frame, so a slow consumer stalls
//!   the reader task rather than ballooning memory
//! - a zero-length frame marks its channel EOF; a transport EOF or error
//!   ends every live channel and handle at once
//!
//! Ownership: user-facing handles and streams hold `Arc<Shared>`; the
//! reader holds only a `Weak` plus a shutdown signal, so dropping the last
//! handle closes the write side and unwinds both tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use bh_protocol::{packet, Frame, FrameCodec, Packet, PROTOCOL_CHANNEL};

use crate::error::{Result, SecurityError};

use super::handle::StreamHandle;

/// Frames buffered per data channel before the reader task stalls.
const CHANNEL_QUEUE: usize = 1;
/// Packets buffered per handle.
const PACKET_QUEUE: usize = 32;
/// Frames buffered toward the writer task.
const WRITE_QUEUE: usize = 16;

/// Which end of the connection we are; decides the channel id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// The requesting server: ids count up from 1.
    Connect,
    /// The accepting dispatcher: ids count down from 500000, so the two
    /// sides can never collide without coordination.
    Accept,
}

const ACCEPT_ID_BASE: u32 = 500_000;

#[derive(Debug, Clone)]
pub(crate) enum ShutReason {
    PeerEof,
    Error(String),
}

enum ChannelSlot {
    /// A stream is reading this channel.
    Attached(mpsc::Sender<Bytes>),
    /// Frames arrived before any stream attached; kept in order.
    Pending { frames: VecDeque<Bytes>, eof: bool },
}

struct ConnState {
    channels: HashMap<u32, ChannelSlot>,
    /// Channels whose EOF token has been seen.
    eof_channels: HashSet<u32>,
    /// Channels closed locally; late frames for them are discarded.
    dead_channels: HashSet<u32>,
    handles: HashMap<String, mpsc::Sender<Packet>>,
    shut: Option<ShutReason>,
}

pub(crate) struct Shared {
    peer: String,
    peer_addr: Option<IpAddr>,
    side: Side,
    write_tx: mpsc::Sender<Frame>,
    next_channel: AtomicU32,
    state: Mutex<ConnState>,
    /// Dropped with the last user reference; wakes the reader task.
    _shutdown_tx: mpsc::Sender<()>,
}

pub(crate) type AcceptTx = mpsc::Sender<(StreamHandle, Packet)>;

impl Shared {
    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }

    pub(crate) fn is_shut(&self) -> bool {
        self.state.lock().unwrap().shut.is_some()
    }

    pub(crate) fn shut_error(&self) -> Option<SecurityError> {
        match self.state.lock().unwrap().shut.as_ref()? {
            ShutReason::PeerEof => Some(SecurityError::PeerEof),
            ShutReason::Error(text) => Some(SecurityError::ReadError(text.clone())),
        }
    }

    /// Allocate the next channel id for this side of the connection.
    pub(crate) fn alloc_channel_id(&self) -> u32 {
        let n = self.next_channel.fetch_add(1, Ordering::Relaxed);
        match self.side {
            Side::Connect => 1 + n,
            Side::Accept => ACCEPT_ID_BASE - n,
        }
    }

    /// Attach a stream to `id`, draining any frames that arrived early.
    /// Returns `(buffered frames, eof already seen, live queue)`.
    pub(crate) fn attach_channel(
        &self,
        id: u32,
    ) -> (VecDeque<Bytes>, bool, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE);
        let mut st = self.state.lock().unwrap();
        st.dead_channels.remove(&id);
        let (frames, eof) = match st.channels.insert(id, ChannelSlot::Attached(tx)) {
            Some(ChannelSlot::Pending { frames, eof }) => (frames, eof),
            _ => (VecDeque::new(), false),
        };
        if eof {
            st.eof_channels.insert(id);
        }
        (frames, eof || st.eof_channels.contains(&id), rx)
    }

    pub(crate) fn channel_at_eof(&self, id: u32) -> bool {
        self.state.lock().unwrap().eof_channels.contains(&id)
    }

    /// Detach a locally-closed channel; late peer frames are discarded.
    pub(crate) fn release_channel(&self, id: u32) {
        let mut st = self.state.lock().unwrap();
        st.channels.remove(&id);
        st.dead_channels.insert(id);
    }

    pub(crate) fn register_handle(&self, token: &str) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(PACKET_QUEUE);
        self.state
            .lock()
            .unwrap()
            .handles
            .insert(token.to_owned(), tx);
        rx
    }

    pub(crate) fn release_handle(&self, token: &str) {
        self.state.lock().unwrap().handles.remove(token);
    }

    /// Queue one frame for the writer task.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| SecurityError::write("connection closed"))
    }

    /// Best-effort frame send for synchronous contexts (Drop impls).
    pub(crate) fn try_send_frame(&self, frame: Frame) {
        let _ = self.write_tx.try_send(frame);
    }

    /// Queue one packet on the protocol channel.
    pub(crate) async fn send_packet(&self, token: &str, seq: u32, pkt: &Packet) -> Result<()> {
        let wire = packet::encode(token, seq, pkt);
        self.send_frame(Frame::data(PROTOCOL_CHANNEL, wire.into_bytes()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Establishment
// ---------------------------------------------------------------------------

/// Start the reader/writer tasks over an established, authenticated byte
/// stream and return the shared connection state.
pub(crate) fn establish<R, W>(
    peer: String,
    peer_addr: Option<IpAddr>,
    side: Side,
    read_half: R,
    write_half: W,
    accept_tx: Option<AcceptTx>,
) -> Arc<Shared>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let shared = Arc::new(Shared {
        peer,
        peer_addr,
        side,
        write_tx,
        next_channel: AtomicU32::new(0),
        state: Mutex::new(ConnState {
            channels: HashMap::new(),
            eof_channels: HashSet::new(),
            dead_channels: HashSet::new(),
            handles: HashMap::new(),
            shut: None,
        }),
        _shutdown_tx: shutdown_tx,
    });

    tokio::spawn(run_writer(
        FramedWrite::new(write_half, FrameCodec),
        write_rx,
    ));
    tokio::spawn(run_reader(
        Arc::downgrade(&shared),
        FramedRead::new(read_half, FrameCodec),
        accept_tx,
        shutdown_rx,
    ));

    shared
}

async fn run_writer<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "connection write failed");
            return;
        }
    }
    let _ = SinkExt::<Frame>::close(&mut sink).await;
}

async fn run_reader<R>(
    weak: Weak<Shared>,
    mut frames: FramedRead<R, FrameCodec>,
    accept_tx: Option<AcceptTx>,
    mut shutdown_rx: mpsc::Receiver<()>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reason = loop {
        let item = tokio::select! {
            item = frames.next() => item,
            _ = shutdown_rx.recv() => return,
        };
        let Some(shared) = weak.upgrade() else { return };
        match item {
            // Read of zero bytes at a frame boundary: peer closed.
            None => break ShutReason::PeerEof,
            Some(Err(e)) => break ShutReason::Error(e.to_string()),
            Some(Ok(frame)) => {
                if frame.channel == PROTOCOL_CHANNEL {
                    route_packet(&shared, frame.payload, accept_tx.as_ref()).await;
                } else if frame.is_eof() {
                    mark_channel_eof(&shared, frame.channel);
                } else {
                    route_data(&shared, frame.channel, frame.payload).await;
                }
            }
        }
    };

    if let Some(shared) = weak.upgrade() {
        let peer = shared.peer.clone();
        match &reason {
            ShutReason::PeerEof => debug!(peer = %peer, "connection closed by peer"),
            ShutReason::Error(e) => warn!(peer = %peer, error = %e, "connection failed"),
        }
        let mut st = shared.state.lock().unwrap();
        st.shut = Some(reason);
        // Dropping every sender synthesizes EOF/error on all live channels
        // and handles; readers see the shut reason when they drain out.
        st.channels.clear();
        st.handles.clear();
    }
}

async fn route_packet(shared: &Arc<Shared>, payload: Bytes, accept_tx: Option<&AcceptTx>) {
    let text = match std::str::from_utf8(&payload) {
        Ok(t) => t,
        Err(_) => {
            warn!(peer = shared.peer(), "non-text payload on the protocol channel");
            return;
        }
    };
    let decoded = match packet::decode(text) {
        Ok(d) => d,
        Err(e) => {
            warn!(peer = shared.peer(), error = %e, "dropping malformed packet");
            return;
        }
    };

    let known = {
        let st = shared.state.lock().unwrap();
        st.handles.get(&decoded.handle).cloned()
    };
    if let Some(tx) = known {
        if tx.send(decoded.packet).await.is_err() {
            shared.release_handle(&decoded.handle);
        }
        return;
    }

    match accept_tx {
        Some(accept_tx) if decoded.packet.kind == bh_protocol::PacketKind::Req => {
            let rx = shared.register_handle(&decoded.handle);
            let handle = StreamHandle::new(Arc::clone(shared), decoded.handle.clone(), rx);
            if accept_tx.send((handle, decoded.packet)).await.is_err() {
                shared.release_handle(&decoded.handle);
            }
        }
        _ => {
            debug!(
                peer = shared.peer(),
                handle = %decoded.handle,
                kind = %decoded.packet.kind,
                "packet for unknown handle dropped"
            );
        }
    }
}

fn mark_channel_eof(shared: &Arc<Shared>, channel: u32) {
    let mut st = shared.state.lock().unwrap();
    st.eof_channels.insert(channel);
    let attached = matches!(st.channels.get(&channel), Some(ChannelSlot::Attached(_)));
    if attached {
        // Dropping the sender delivers EOF after all buffered payload.
        st.channels.remove(&channel);
    } else if let Some(ChannelSlot::Pending { eof, .. }) = st.channels.get_mut(&channel) {
        *eof = true;
    } else if !st.dead_channels.contains(&channel) {
        st.channels.insert(
            channel,
            ChannelSlot::Pending { frames: VecDeque::new(), eof: true },
        );
    }
}

async fn route_data(shared: &Arc<Shared>, channel: u32, payload: Bytes) {
    let tx = {
        let mut st = shared.state.lock().unwrap();
        if st.dead_channels.contains(&channel) {
            return;
        }
        match st.channels.get_mut(&channel) {
            Some(ChannelSlot::Attached(tx)) => Some(tx.clone()),
            Some(ChannelSlot::Pending { frames, .. }) => {
                frames.push_back(payload);
                return;
            }
            None => {
                let mut frames = VecDeque::new();
                frames.push_back(payload);
                st.channels
                    .insert(channel, ChannelSlot::Pending { frames, eof: false });
                return;
            }
        }
    };
    if let Some(tx) = tx {
        if tx.send(payload).await.is_err() {
            shared.release_channel(channel);
        }
    }
}
