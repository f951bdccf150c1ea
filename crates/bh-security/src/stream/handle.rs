//! User-facing handle and stream types for the stream-driver family.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use bh_protocol::{Frame, Packet, MAX_FRAME_BYTES};

use crate::error::{Result, SecurityError};

use super::conn::Shared;

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// One request/reply relationship with the peer, multiplexed with any
/// number of siblings over the shared connection.  Packets to and from
/// this handle travel on the protocol channel tagged with its token.
pub struct StreamHandle {
    shared: Arc<Shared>,
    token: String,
    next_seq: u32,
    rx: mpsc::Receiver<Packet>,
    closed: bool,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<Shared>, token: String, rx: mpsc::Receiver<Packet>) -> Self {
        StreamHandle { shared, token, next_seq: 0, rx, closed: false }
    }

    /// Create a handle with a fresh token on the connecting side.
    pub(crate) fn open(shared: Arc<Shared>) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let rx = shared.register_handle(&token);
        StreamHandle::new(shared, token, rx)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn peer_name(&self) -> &str {
        self.shared.peer()
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.shared.peer_addr()
    }

    pub async fn sendpkt(&mut self, pkt: &Packet) -> Result<()> {
        if self.closed {
            return Err(SecurityError::write("handle closed"));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.shared.send_packet(&self.token, seq, pkt).await
    }

    /// Wait for the next packet addressed to this handle.  `Ok(None)`
    /// means the timeout elapsed; no packet is lost or delivered late.
    pub async fn recvpkt(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>> {
        let received = match timeout {
            Some(t) => match tokio::time::timeout(t, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(r) => r,
            },
            None => self.rx.recv().await,
        };
        match received {
            Some(pkt) => Ok(Some(pkt)),
            None => Err(self.shared.shut_error().unwrap_or(SecurityError::PeerEof)),
        }
    }

    /// Open a new channel with a locally-allocated id.
    pub fn stream_server(&self) -> SecurityStream {
        let id = self.shared.alloc_channel_id();
        SecurityStream::attach(Arc::clone(&self.shared), id)
    }

    /// Open the channel the peer named in its CONNECT line.
    pub fn stream_client(&self, id: u32) -> SecurityStream {
        SecurityStream::attach(Arc::clone(&self.shared), id)
    }

    /// Release the handle.  Idempotent; pending receives on it end with an
    /// error, and the connection itself closes with its last handle.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.release_handle(&self.token);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// SecurityStream
// ---------------------------------------------------------------------------

/// What one read on a channel produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    Data(Bytes),
    /// The peer closed its end; repeats on every further read.
    Eof,
}

/// One bidirectional byte channel inside a connection.  Relays that pump
/// both directions concurrently take it apart with [`into_split`].
///
/// [`into_split`]: SecurityStream::into_split
pub struct SecurityStream {
    reader: StreamReader,
    writer: StreamWriter,
}

impl SecurityStream {
    pub(crate) fn attach(shared: Arc<Shared>, id: u32) -> Self {
        let (pending, eof_after_pending, rx) = shared.attach_channel(id);
        SecurityStream {
            reader: StreamReader {
                shared: Arc::clone(&shared),
                id,
                pending,
                eof_after_pending,
                rx,
                at_eof: false,
            },
            writer: StreamWriter { shared, id, closed: false },
        }
    }

    pub fn id(&self) -> u32 {
        self.writer.id
    }

    /// See [`StreamWriter::write`].
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        self.writer.write(buf).await
    }

    /// See [`StreamReader::read`].
    pub async fn read(&mut self) -> Result<StreamRead> {
        self.reader.read().await
    }

    /// Close our end: the peer's reads on this channel return EOF.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

/// The receiving half of a channel.
pub struct StreamReader {
    shared: Arc<Shared>,
    id: u32,
    /// Frames that arrived before this stream attached, oldest first.
    pending: VecDeque<Bytes>,
    eof_after_pending: bool,
    rx: mpsc::Receiver<Bytes>,
    at_eof: bool,
}

impl StreamReader {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the next complete frame on this channel.
    pub async fn read(&mut self) -> Result<StreamRead> {
        if let Some(buf) = self.pending.pop_front() {
            return Ok(StreamRead::Data(buf));
        }
        if self.at_eof {
            return Ok(StreamRead::Eof);
        }
        if self.eof_after_pending {
            self.at_eof = true;
            return Ok(StreamRead::Eof);
        }
        match self.rx.recv().await {
            Some(buf) => Ok(StreamRead::Data(buf)),
            None => {
                if self.shared.channel_at_eof(self.id) {
                    self.at_eof = true;
                    return Ok(StreamRead::Eof);
                }
                match self.shared.shut_error() {
                    // A clean connection close is EOF on every live channel.
                    Some(SecurityError::PeerEof) | None => {
                        self.at_eof = true;
                        Ok(StreamRead::Eof)
                    }
                    Some(err) => Err(err),
                }
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.shared.release_channel(self.id);
    }
}

/// The sending half of a channel.
pub struct StreamWriter {
    shared: Arc<Shared>,
    id: u32,
    closed: bool,
}

impl StreamWriter {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send one frame carrying `buf`.  The buffer is never fragmented
    /// across frames; an empty write is elided (a zero-length frame on the
    /// wire would read as EOF) and succeeds without side effects.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SecurityError::write("stream closed"));
        }
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > MAX_FRAME_BYTES {
            return Err(SecurityError::FrameOversize(buf.len()));
        }
        self.shared
            .send_frame(Frame::data(self.id, Bytes::copy_from_slice(buf)))
            .await
    }

    /// Send the end-of-stream token.  Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.shared.is_shut() {
            self.shared.send_frame(Frame::eof(self.id)).await?;
        }
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if !self.shared.is_shut() {
                self.shared.try_send_frame(Frame::eof(self.id));
            }
        }
    }
}
