//! Driver selection and the unified handle surface.
//!
//! Every transport is addressed by its wire token (`bsd`, `bsdtcp`,
//! `ssl`, ...).  The datagram family yields [`DatagramHandle`]s, the
//! stream family [`StreamHandle`]s; [`Handle`] folds the two behind the
//! operations the protocol machines use, and keeps the last error text
//! the way the drivers' callers expect to find it.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bh_protocol::Packet;

use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::stream::{child, tcp, tls, SecurityStream, StreamAcceptor, StreamHandle};
use crate::udp::{self, DatagramAcceptor, DatagramHandle};

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Datagram request/reply (the historic default).
    Bsd,
    /// Alias of `bsd` kept for configuration compatibility.
    BsdUdp,
    /// Plain TCP with the reserved-port convention.
    BsdTcp,
    Rsh,
    Ssh,
    Local,
    /// TLS with certificate policy.
    Ssl,
}

impl DriverKind {
    /// Look a driver up by its wire/configuration token.
    pub fn from_token(token: &str) -> Result<DriverKind> {
        match token {
            "bsd" => Ok(DriverKind::Bsd),
            "bsdudp" => Ok(DriverKind::BsdUdp),
            "bsdtcp" => Ok(DriverKind::BsdTcp),
            "rsh" => Ok(DriverKind::Rsh),
            "ssh" => Ok(DriverKind::Ssh),
            "local" => Ok(DriverKind::Local),
            "ssl" => Ok(DriverKind::Ssl),
            // Recognized but not carried by this implementation.
            "krb5" => Err(SecurityError::Unsupported("krb5")),
            _ => Err(SecurityError::Unsupported("unknown")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Bsd => "bsd",
            DriverKind::BsdUdp => "bsdudp",
            DriverKind::BsdTcp => "bsdtcp",
            DriverKind::Rsh => "rsh",
            DriverKind::Ssh => "ssh",
            DriverKind::Local => "local",
            DriverKind::Ssl => "ssl",
        }
    }

    pub fn is_stream(self) -> bool {
        !matches!(self, DriverKind::Bsd | DriverKind::BsdUdp)
    }
}

/// One connect attempt via the chosen driver.
pub async fn connect(kind: DriverKind, host: &str, cfg: &SecurityConfig) -> Result<Handle> {
    match kind {
        DriverKind::Bsd | DriverKind::BsdUdp => {
            Ok(Handle::datagram(udp::connect(host, cfg).await?))
        }
        DriverKind::BsdTcp => Ok(Handle::stream(tcp::connect(host, cfg).await?)),
        DriverKind::Ssl => Ok(Handle::stream(tls::connect(host, cfg).await?)),
        DriverKind::Rsh | DriverKind::Ssh | DriverKind::Local => {
            Ok(Handle::stream(child::connect(kind, host, cfg).await?))
        }
    }
}

/// How a dispatcher binds for incoming requests.
#[derive(Debug, Clone, Copy)]
pub enum ListenMode {
    /// Bind a datagram mailbox; `None` walks the reserved range.
    Udp(Option<u16>),
    /// Bind a TCP or TLS listener.
    Tcp(u16),
    /// Serve the connection already on stdin/stdout (inetd/sshd child).
    Stdio,
}

pub async fn listen(kind: DriverKind, mode: ListenMode, cfg: &SecurityConfig) -> Result<Acceptor> {
    match (kind, mode) {
        (DriverKind::Bsd | DriverKind::BsdUdp, ListenMode::Udp(port)) => {
            Ok(Acceptor::Datagram(udp::listen(port, cfg).await?))
        }
        (DriverKind::BsdTcp, ListenMode::Tcp(port)) => {
            Ok(Acceptor::Stream(tcp::listen(port, cfg).await?))
        }
        (DriverKind::Ssl, ListenMode::Tcp(port)) => {
            Ok(Acceptor::Stream(tls::listen(port, cfg).await?))
        }
        (DriverKind::Rsh | DriverKind::Ssh | DriverKind::Local, ListenMode::Stdio) => {
            Ok(Acceptor::Stream(child::accept_stdio(kind, cfg)?))
        }
        (kind, _) => Err(SecurityError::Unsupported(kind.name())),
    }
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

pub enum Acceptor {
    Datagram(DatagramAcceptor),
    Stream(StreamAcceptor),
}

impl Acceptor {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Acceptor::Datagram(a) => a.local_addr(),
            Acceptor::Stream(a) => a.local_addr(),
        }
    }

    /// Wait for the next incoming request.
    pub async fn accept(&mut self) -> Result<(Handle, Packet)> {
        match self {
            Acceptor::Datagram(a) => {
                let (handle, pkt) = a.accept().await?;
                Ok((Handle::datagram(handle), pkt))
            }
            Acceptor::Stream(a) => {
                let (handle, pkt) = a.accept().await?;
                Ok((Handle::stream(handle), pkt))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum HandleInner {
    Datagram(DatagramHandle),
    Stream(StreamHandle),
}

/// One relationship with one peer over one driver.
pub struct Handle {
    inner: HandleInner,
    last_error: Option<String>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Handle {
    pub(crate) fn datagram(inner: DatagramHandle) -> Handle {
        Handle { inner: HandleInner::Datagram(inner), last_error: None }
    }

    pub(crate) fn stream(inner: StreamHandle) -> Handle {
        Handle { inner: HandleInner::Stream(inner), last_error: None }
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    /// The most recent error text, kept until the next failure replaces it.
    pub fn error_text(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn peer_name(&self) -> &str {
        match &self.inner {
            HandleInner::Datagram(h) => h.peer_name(),
            HandleInner::Stream(h) => h.peer_name(),
        }
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        match &self.inner {
            HandleInner::Datagram(h) => h.peer_addr(),
            HandleInner::Stream(h) => h.peer_addr(),
        }
    }

    pub async fn sendpkt(&mut self, pkt: &Packet) -> Result<()> {
        let result = match &mut self.inner {
            HandleInner::Datagram(h) => h.sendpkt(pkt).await,
            HandleInner::Stream(h) => h.sendpkt(pkt).await,
        };
        self.note(result)
    }

    /// Wait for the next packet for this handle; `Ok(None)` is a timeout.
    /// At most one receive can be outstanding, which `&mut self` enforces;
    /// dropping the future is the cancel operation.
    pub async fn recvpkt(&mut self, timeout: Option<Duration>) -> Result<Option<Packet>> {
        let result = match &mut self.inner {
            HandleInner::Datagram(h) => h.recvpkt(timeout).await,
            HandleInner::Stream(h) => h.recvpkt(timeout).await,
        };
        self.note(result)
    }

    /// Open a new channel with a locally-chosen id (stream drivers only).
    pub fn stream_server(&mut self) -> Result<SecurityStream> {
        let result = match &self.inner {
            HandleInner::Datagram(_) => Err(SecurityError::Unsupported("bsdudp")),
            HandleInner::Stream(h) => Ok(h.stream_server()),
        };
        self.note(result)
    }

    /// Open the peer-announced channel `id` (stream drivers only).
    pub fn stream_client(&mut self, id: u32) -> Result<SecurityStream> {
        let result = match &self.inner {
            HandleInner::Datagram(_) => Err(SecurityError::Unsupported("bsdudp")),
            HandleInner::Stream(h) => Ok(h.stream_client(id)),
        };
        self.note(result)
    }

    /// Release the handle and everything it owns.  Idempotent.
    pub fn close(&mut self) {
        match &mut self.inner {
            HandleInner::Datagram(h) => h.close(),
            HandleInner::Stream(h) => h.close(),
        }
    }
}
