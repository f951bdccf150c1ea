//! Privilege and reserved-port plumbing shared by the drivers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use nix::unistd::{geteuid, getuid, seteuid, Uid};
use tokio::net::TcpSocket;
use tracing::debug;

use crate::error::{Result, SecurityError};

/// Ports below this are bindable only with privilege; a peer speaking from
/// one is presumed to be a system daemon rather than an arbitrary user.
pub const IPPORT_RESERVED: u16 = 1024;

/// Run `f` with the effective uid briefly raised to root when the process
/// is able to (setuid-root binaries running with privileges lowered).
/// Restores the previous effective uid before returning.
pub(crate) fn with_euid_root<T>(f: impl FnOnce() -> T) -> T {
    let orig = geteuid();
    if orig.is_root() {
        return f();
    }
    if seteuid(Uid::from_raw(0)).is_ok() {
        let out = f();
        if seteuid(orig).is_err() {
            // Refusing to continue with elevated privileges.
            let _ = seteuid(Uid::from_raw(getuid().as_raw()));
        }
        out
    } else {
        f()
    }
}

fn unspecified(addr: &SocketAddr, port: u16) -> SocketAddr {
    if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
    }
}

fn new_tcp_socket(addr: &SocketAddr) -> std::io::Result<TcpSocket> {
    if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
}

/// Walk the reserved range, high to low, for a bindable TCP source port.
pub(crate) fn reserved_tcp_socket(
    dest: &SocketAddr,
    range: (u16, u16),
) -> Result<TcpSocket> {
    let (lo, hi) = range;
    with_euid_root(|| {
        for port in (lo..=hi).rev() {
            let socket = new_tcp_socket(dest).map_err(SecurityError::write)?;
            socket.set_reuseaddr(true).map_err(SecurityError::write)?;
            if socket.bind(unspecified(dest, port)).is_ok() {
                debug!(port, "bound reserved source port");
                return Ok(socket);
            }
        }
        Err(SecurityError::ReservedPortUnavailable { lo, hi })
    })
}

/// Walk the reserved range for a UDP port; `None` falls back to the range,
/// `Some(p)` binds exactly `p` (0 meaning any ephemeral port).
pub(crate) fn bind_udp(
    port: Option<u16>,
    range: (u16, u16),
    ipv6: bool,
) -> Result<std::net::UdpSocket> {
    let any: IpAddr = if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let bound = match port {
        Some(p) => std::net::UdpSocket::bind(SocketAddr::new(any, p))
            .map_err(SecurityError::write)?,
        None => {
            let (lo, hi) = range;
            with_euid_root(|| {
                for p in (lo..=hi).rev() {
                    if let Ok(s) = std::net::UdpSocket::bind(SocketAddr::new(any, p)) {
                        debug!(port = p, "bound reserved datagram port");
                        return Ok(s);
                    }
                }
                Err(SecurityError::ReservedPortUnavailable { lo, hi })
            })?
        }
    };
    bound.set_nonblocking(true).map_err(SecurityError::write)?;
    Ok(bound)
}
