//! Plain-TCP stream driver.
//!
//! The credential here is the classic reserved-port convention: the
//! connecting side binds a source port below 1024 (briefly elevating if it
//! can), and the listener refuses peers that did not.  Everything after
//! the socket is the shared framing layer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::util::{reserved_tcp_socket, IPPORT_RESERVED};

use super::conn::{establish, Shared, Side};
use super::handle::StreamHandle;
use super::StreamAcceptor;

pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| SecurityError::ResolveHostname(host.to_owned()))?;
    addrs
        .next()
        .ok_or_else(|| SecurityError::ResolveHostname(host.to_owned()))
}

/// One connect attempt to `host`; retry policy belongs to the caller.
pub async fn connect(host: &str, cfg: &SecurityConfig) -> Result<StreamHandle> {
    let stream = connect_socket(host, cfg).await?;
    let peer_addr = stream.peer_addr().ok().map(|a| a.ip());
    let (read_half, write_half) = stream.into_split();
    let shared = establish(
        host.to_owned(),
        peer_addr,
        Side::Connect,
        read_half,
        write_half,
        None,
    );
    Ok(StreamHandle::open(shared))
}

pub(crate) async fn connect_socket(host: &str, cfg: &SecurityConfig) -> Result<TcpStream> {
    let dest = resolve(host, cfg.service_port).await?;
    let socket = if cfg.bind_reserved_port {
        reserved_tcp_socket(&dest, cfg.reserved_port_range)?
    } else if dest.is_ipv4() {
        TcpSocket::new_v4().map_err(SecurityError::write)?
    } else {
        TcpSocket::new_v6().map_err(SecurityError::write)?
    };
    match tokio::time::timeout(cfg.connect_timeout, socket.connect(dest)).await {
        Err(_) => Err(SecurityError::ConnectTimeout(host.to_owned())),
        Ok(Err(e)) => Err(SecurityError::write(format!("connect to {host}: {e}"))),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Listen for incoming connections; each REQ on any of them surfaces
/// through the returned acceptor.
pub async fn listen(port: u16, cfg: &SecurityConfig) -> Result<StreamAcceptor> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(SecurityError::write)?;
    let local_addr = listener.local_addr().ok();
    let (accept_tx, accept_rx) = mpsc::channel(8);
    let require_reserved = cfg.require_reserved_peer_port;

    tokio::spawn(async move {
        let mut conns: Vec<Arc<Shared>> = Vec::new();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                // The dispatcher dropped its acceptor; stop listening.
                _ = accept_tx.closed() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    continue;
                }
            };
            conns.retain(|c| !c.is_shut());
            if require_reserved && peer.port() >= IPPORT_RESERVED {
                warn!(%peer, "rejecting connection from unprivileged port");
                continue;
            }
            debug!(%peer, "accepted tcp connection");
            let (read_half, write_half) = stream.into_split();
            conns.push(establish(
                peer.ip().to_string(),
                Some(peer.ip()),
                Side::Accept,
                read_half,
                write_half,
                Some(accept_tx.clone()),
            ));
        }
    });

    Ok(StreamAcceptor::new(accept_rx, local_addr, Vec::new()))
}
