//! The stream-driver family: framed, authenticated, channel-multiplexed
//! byte connections shared by one or more request handles.
//!
//! `tcp` is the plain-TCP driver, `tls` wraps it in a TLS handshake with
//! certificate policy, and `child` spawns rsh/ssh/local transport
//! processes whose stdio becomes the connection.

pub(crate) mod conn;
mod handle;

pub mod child;
pub mod tcp;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use bh_protocol::Packet;

use crate::error::{Result, SecurityError};

pub use handle::{SecurityStream, StreamHandle, StreamRead, StreamReader, StreamWriter};

/// Yields one `(handle, request)` pair per incoming request, across every
/// connection the listener has accepted.
pub struct StreamAcceptor {
    rx: mpsc::Receiver<(StreamHandle, Packet)>,
    local_addr: Option<SocketAddr>,
    /// Keeps single-connection (stdio) transports alive for the duration
    /// of the acceptor; listener tasks own their connections themselves.
    _pinned: Vec<Arc<conn::Shared>>,
}

impl StreamAcceptor {
    pub(crate) fn new(
        rx: mpsc::Receiver<(StreamHandle, Packet)>,
        local_addr: Option<SocketAddr>,
        pinned: Vec<Arc<conn::Shared>>,
    ) -> Self {
        StreamAcceptor { rx, local_addr, _pinned: pinned }
    }

    /// The bound listener address, when there is one (TCP/TLS listeners).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn accept(&mut self) -> Result<(StreamHandle, Packet)> {
        self.rx.recv().await.ok_or(SecurityError::PeerEof)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use bh_protocol::{Packet, PacketKind};

    use super::conn::{establish, Shared, Side};
    use super::handle::{StreamHandle, StreamRead};

    /// Two connections talking over an in-memory duplex, like one TCP
    /// socket with the framing layer on both ends.
    fn pair() -> (
        StreamHandle,
        Arc<Shared>,
        mpsc::Receiver<(StreamHandle, Packet)>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client_shared = establish(
            "server".into(),
            None,
            Side::Connect,
            client_read,
            client_write,
            None,
        );
        let (accept_tx, accept_rx) = mpsc::channel(4);
        let server_shared = establish(
            "client".into(),
            None,
            Side::Accept,
            server_read,
            server_write,
            Some(accept_tx),
        );
        (StreamHandle::open(client_shared), server_shared, accept_rx)
    }

    /// Test: a REQ for an unknown handle synthesizes one on the accepting
    /// side, and replies route back to the right requester only.
    #[tokio::test]
    async fn packets_route_by_handle() {
        let (mut client, _shared, mut accept_rx) = pair();
        // A second handle multiplexed over the same connection.
        let mut second = StreamHandle::open(Arc::clone(client_shared_of(&client)));

        client.sendpkt(&Packet::req("SERVICE noop\n")).await.unwrap();
        second.sendpkt(&Packet::req("SERVICE selfcheck\n")).await.unwrap();

        let (mut peer_one, req_one) = accept_rx.recv().await.unwrap();
        let (mut peer_two, req_two) = accept_rx.recv().await.unwrap();
        assert_eq!(req_one.kind, PacketKind::Req);
        assert_eq!(req_one.body, "SERVICE noop\n");
        assert_eq!(req_two.body, "SERVICE selfcheck\n");

        // Reply only to the second request; the first handle sees nothing.
        peer_two.sendpkt(&Packet::rep("two\n")).await.unwrap();
        let got = second
            .recvpkt(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("second handle gets its reply");
        assert_eq!(got.body, "two\n");
        let nothing = client.recvpkt(Some(Duration::from_millis(100))).await.unwrap();
        assert!(nothing.is_none(), "reply leaked to the wrong handle");
        peer_one.close();
    }

    /// Test: accepting-side ids count down from 500000, connecting-side
    /// ids up from 1; the ranges cannot collide.
    #[tokio::test]
    async fn channel_ids_are_disjoint() {
        let (mut client, _shared, mut accept_rx) = pair();
        client.sendpkt(&Packet::req("SERVICE noop\n")).await.unwrap();
        let (server, _req) = accept_rx.recv().await.unwrap();

        let s1 = server.stream_server();
        let s2 = server.stream_server();
        assert_eq!(s1.id(), 500_000);
        assert_eq!(s2.id(), 499_999);

        let c1 = client.stream_server();
        let c2 = client.stream_server();
        assert_eq!(c1.id(), 1);
        assert_eq!(c2.id(), 2);
    }

    /// Test: bytes arrive in order, EOF arrives after them exactly once
    /// per close, and repeats on further reads.
    #[tokio::test]
    async fn channel_data_order_and_eof() {
        let (mut client, _shared, mut accept_rx) = pair();
        client.sendpkt(&Packet::req("SERVICE noop\n")).await.unwrap();
        let (server, _req) = accept_rx.recv().await.unwrap();

        let stream = server.stream_server();
        let id = stream.id();
        let mut local = client.stream_client(id);

        stream.write(b"first").await.unwrap();
        stream.write(b"second").await.unwrap();
        let (_reader, mut writer) = stream.into_split();
        writer.close().await.unwrap();

        assert_eq!(local.read().await.unwrap(), StreamRead::Data(bytes::Bytes::from_static(b"first")));
        assert_eq!(local.read().await.unwrap(), StreamRead::Data(bytes::Bytes::from_static(b"second")));
        assert_eq!(local.read().await.unwrap(), StreamRead::Eof);
        assert_eq!(local.read().await.unwrap(), StreamRead::Eof);
    }

    /// Test: a zero-length write succeeds and is not an EOF to the peer.
    #[tokio::test]
    async fn zero_length_write_is_not_eof() {
        let (mut client, _shared, mut accept_rx) = pair();
        client.sendpkt(&Packet::req("SERVICE noop\n")).await.unwrap();
        let (server, _req) = accept_rx.recv().await.unwrap();

        let stream = server.stream_server();
        let mut local = client.stream_client(stream.id());

        stream.write(b"").await.unwrap();
        stream.write(b"after-empty").await.unwrap();
        match local.read().await.unwrap() {
            StreamRead::Data(buf) => assert_eq!(&buf[..], b"after-empty"),
            StreamRead::Eof => panic!("zero-length write was read as EOF"),
        }
    }

    /// Test: frames that arrive before the reader attaches are kept in
    /// order and delivered at attach time.
    #[tokio::test]
    async fn early_frames_wait_for_the_reader() {
        let (mut client, _shared, mut accept_rx) = pair();
        client.sendpkt(&Packet::req("SERVICE noop\n")).await.unwrap();
        let (server, _req) = accept_rx.recv().await.unwrap();

        let stream = server.stream_server();
        let id = stream.id();
        stream.write(b"early").await.unwrap();
        // Let the frame cross before the client side attaches.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut local = client.stream_client(id);
        match local.read().await.unwrap() {
            StreamRead::Data(buf) => assert_eq!(&buf[..], b"early"),
            StreamRead::Eof => panic!("pending frame lost"),
        }
    }

    fn client_shared_of(handle: &StreamHandle) -> &Arc<Shared> {
        handle.shared()
    }
}
