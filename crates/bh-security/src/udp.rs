//! Datagram driver: one UDP datagram per packet.
//!
//! Outgoing REQs assert the sending user with a leading
//! `SECURITY USER <name>` line; the accepting side requires the peer to
//! speak from a reserved port, parses that line, and runs the hosts-file
//! authorization before a request ever reaches the dispatcher.  Incoming
//! datagrams are routed by `(peer address, handle token)`, so a
//! retransmitted REQ lands on the request it duplicates instead of
//! spawning a second one.
//!
//! This family carries packets only; data channels belong to the stream
//! drivers.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bh_protocol::{packet, Packet, PacketKind, MAX_DGRAM_BYTES};

use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::hostauth::{self, Peer};
use crate::util::{bind_udp, IPPORT_RESERVED};

const PACKET_QUEUE: usize = 32;
const ACCEPT_QUEUE: usize = 8;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub struct DatagramHandle {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    peer_name: String,
    token: String,
    next_seq: u32,
    auth_user: String,
    rx: mpsc::Receiver<Packet>,
    /// Set on accepted handles so close() can unregister the route.
    registry: Option<Arc<Registry>>,
    closed: bool,
}

impl DatagramHandle {
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        Some(self.peer_addr.ip())
    }

    pub async fn sendpkt(&mut self, pkt: &Packet) -> Result<()> {
        if self.closed {
            return Err(SecurityError::write("handle closed"));
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        // REQ bodies on this family always open with the asserted user.
        let wire = if pkt.kind == PacketKind::Req && !pkt.body.starts_with("SECURITY USER ") {
            let body = format!("SECURITY USER {}\n{}", self.auth_user, pkt.body);
            packet::encode(&self.token, seq, &Packet::new(pkt.kind, body))
        } else {
            packet::encode(&self.token, seq, pkt)
        };
        if wire.len() > MAX_DGRAM_BYTES {
            return Err(SecurityError::write(format!(
                "packet of {} bytes exceeds the datagram bound",
                wire.len()
            )));
        }
        self.socket
            .send_to(wire.as_bytes(), self.peer_addr)
            .await
            .map_err(SecurityError::write)?;
        Ok(())
    }

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
            None => Err(SecurityError::PeerEof),
        }
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(registry) = &self.registry {
                registry.remove(&self.peer_addr, &self.token);
            }
        }
    }
}

impl Drop for DatagramHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Open a datagram handle to `host`.  The local socket binds a reserved
/// port when the configuration asks for one.
pub async fn connect(host: &str, cfg: &SecurityConfig) -> Result<DatagramHandle> {
    let peer_addr = crate::stream::tcp::resolve(host, cfg.service_port).await?;
    let std_socket = if cfg.bind_reserved_port {
        bind_udp(None, cfg.reserved_port_range, peer_addr.is_ipv6())?
    } else {
        bind_udp(Some(0), cfg.reserved_port_range, peer_addr.is_ipv6())?
    };
    let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(SecurityError::write)?);

    let token = uuid::Uuid::new_v4().simple().to_string();
    let auth_user = match &cfg.auth_user {
        Some(user) => user.clone(),
        None => hostauth::local_user().map_err(SecurityError::PeerUnauthenticated)?.name,
    };

    let (tx, rx) = mpsc::channel(PACKET_QUEUE);
    let mailbox_socket = Arc::clone(&socket);
    let mailbox_token = token.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DGRAM_BYTES + 1];
        loop {
            let (len, from) = tokio::select! {
                received = mailbox_socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "datagram receive failed");
                        return;
                    }
                },
                _ = tx.closed() => return,
            };
            if from != peer_addr {
                debug!(%from, "ignoring datagram from unexpected peer");
                continue;
            }
            let Some(decoded) = parse_datagram(&buf[..len], from) else { continue };
            if decoded.handle != mailbox_token {
                debug!(handle = %decoded.handle, "datagram for unknown handle");
                continue;
            }
            if tx.send(decoded.packet).await.is_err() {
                return;
            }
        }
    });

    Ok(DatagramHandle {
        socket,
        peer_addr,
        peer_name: host.to_owned(),
        token,
        next_seq: 0,
        auth_user,
        rx,
        registry: None,
        closed: false,
    })
}

fn parse_datagram(buf: &[u8], from: SocketAddr) -> Option<packet::DecodedPacket> {
    if buf.len() > MAX_DGRAM_BYTES {
        warn!(%from, len = buf.len(), "discarding oversize datagram");
        return None;
    }
    let text = match std::str::from_utf8(buf) {
        Ok(t) => t,
        Err(_) => {
            warn!(%from, "discarding non-text datagram");
            return None;
        }
    };
    match packet::decode(text) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(%from, error = %e, "discarding malformed datagram");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Accepting side
// ---------------------------------------------------------------------------

struct Registry {
    routes: Mutex<HashMap<(SocketAddr, String), mpsc::Sender<Packet>>>,
}

impl Registry {
    fn remove(&self, addr: &SocketAddr, token: &str) {
        self.routes
            .lock()
            .unwrap()
            .remove(&(*addr, token.to_owned()));
    }
}

pub struct DatagramAcceptor {
    rx: mpsc::Receiver<(DatagramHandle, Packet)>,
    local_addr: Option<SocketAddr>,
}

impl DatagramAcceptor {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn accept(&mut self) -> Result<(DatagramHandle, Packet)> {
        self.rx.recv().await.ok_or(SecurityError::PeerEof)
    }
}

/// Bind the dispatcher's datagram mailbox.  `port` 0 binds an ephemeral
/// port (tests); `None` walks the reserved range.
pub async fn listen(port: Option<u16>, cfg: &SecurityConfig) -> Result<DatagramAcceptor> {
    let std_socket = bind_udp(port, cfg.reserved_port_range, false)?;
    let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(SecurityError::write)?);
    let local_addr = socket.local_addr().ok();

    let registry = Arc::new(Registry { routes: Mutex::new(HashMap::new()) });
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
    let cfg = cfg.clone();
    let mailbox_socket = Arc::clone(&socket);
    let mailbox_registry = Arc::clone(&registry);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DGRAM_BYTES + 1];
        loop {
            let (len, from) = tokio::select! {
                received = mailbox_socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "datagram mailbox receive failed");
                        return;
                    }
                },
                _ = accept_tx.closed() => return,
            };
            let Some(decoded) = parse_datagram(&buf[..len], from) else { continue };

            let route = {
                let routes = mailbox_registry.routes.lock().unwrap();
                routes.get(&(from, decoded.handle.clone())).cloned()
            };
            if let Some(tx) = route {
                // Existing request; a retransmitted REQ surfaces there as
                // a duplicate rather than a second spawn.
                if tx.send(decoded.packet).await.is_err() {
                    mailbox_registry.remove(&from, &decoded.handle);
                }
                continue;
            }

            if decoded.packet.kind != PacketKind::Req {
                debug!(%from, handle = %decoded.handle, "stray non-REQ datagram dropped");
                continue;
            }

            match authorize_request(&cfg, from, &decoded.packet.body) {
                Ok(user) => {
                    let (tx, rx) = mpsc::channel(PACKET_QUEUE);
                    mailbox_registry
                        .routes
                        .lock()
                        .unwrap()
                        .insert((from, decoded.handle.clone()), tx);
                    let handle = DatagramHandle {
                        socket: Arc::clone(&mailbox_socket),
                        peer_addr: from,
                        peer_name: from.ip().to_string(),
                        token: decoded.handle.clone(),
                        next_seq: 0,
                        auth_user: user,
                        rx,
                        registry: Some(Arc::clone(&mailbox_registry)),
                        closed: false,
                    };
                    if accept_tx.send((handle, decoded.packet)).await.is_err() {
                        return;
                    }
                }
                Err(reason) => {
                    warn!(%from, reason = %reason, "rejecting datagram request");
                    let nak = packet::encode(&decoded.handle, 0, &Packet::nak(format!("ERROR {reason}\n")));
                    let _ = mailbox_socket.send_to(nak.as_bytes(), from).await;
                }
            }
        }
    });

    Ok(DatagramAcceptor { rx: accept_rx, local_addr })
}

/// The per-packet REQ authentication of this family: reserved source
/// port, asserted user, hosts-file authorization.
fn authorize_request(
    cfg: &SecurityConfig,
    from: SocketAddr,
    body: &str,
) -> std::result::Result<String, String> {
    if cfg.require_reserved_peer_port && from.port() >= IPPORT_RESERVED {
        return Err(format!("host {} port {} is not reserved", from.ip(), from.port()));
    }
    let (user, rest) = bh_protocol::body::split_security_user(body)
        .ok_or_else(|| "request has no SECURITY USER line".to_owned())?;
    let service = bh_protocol::ServiceRequest::parse(rest)
        .map(|r| r.service)
        .map_err(|e| e.to_string())?;
    let peer_name = from.ip().to_string();
    hostauth::check(
        cfg,
        Peer {
            hostname: &peer_name,
            addr: from.ip(),
            remote_user: user,
            service: &service,
        },
    )?;
    Ok(user.to_owned())
}
