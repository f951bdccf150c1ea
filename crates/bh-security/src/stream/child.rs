//! Child-process stream drivers: rsh, ssh, local.
//!
//! "Connecting" spawns a transport child whose stdin/stdout become the
//! connection; the remote end of that pipe is a dispatcher started by
//! sshd/rshd (or exec'd directly for the `local` driver).  Privileges are
//! dropped irreversibly before the exec.  Framing and the request/reply
//! protocol are identical to the socket drivers.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::driver::DriverKind;
use crate::error::{Result, SecurityError};

use super::conn::{establish, Side};
use super::handle::StreamHandle;
use super::StreamAcceptor;

/// Spawn the transport child for `host` and open a connection over its
/// stdio.
pub async fn connect(kind: DriverKind, host: &str, cfg: &SecurityConfig) -> Result<StreamHandle> {
    let mut cmd = transport_command(kind, host, cfg)?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    unsafe {
        cmd.pre_exec(drop_privileges);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SecurityError::ChildSpawnFailed(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SecurityError::ChildSpawnFailed("no stdin pipe".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SecurityError::ChildSpawnFailed("no stdout pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SecurityError::ChildSpawnFailed("no stderr pipe".into()))?;

    // Surface transport chatter (ssh warnings and the like) in our logs
    // and reap the child when the connection winds down.
    let log_host = host.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(host = %log_host, line = %line, "transport stderr");
        }
    });
    let wait_host = host.to_owned();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                debug!(host = %wait_host, "transport child exited");
            }
            Ok(status) => warn!(host = %wait_host, %status, "transport child failed"),
            Err(e) => warn!(host = %wait_host, error = %e, "transport child reap failed"),
        }
    });

    let shared = establish(host.to_owned(), None, Side::Connect, stdout, stdin, None);
    Ok(StreamHandle::open(shared))
}

fn transport_command(kind: DriverKind, host: &str, cfg: &SecurityConfig) -> Result<Command> {
    match kind {
        DriverKind::Ssh => {
            let mut cmd = Command::new(&cfg.ssh_program);
            cmd.arg("-o").arg("BatchMode=yes");
            if let Some(user) = &cfg.auth_user {
                cmd.arg("-l").arg(user);
            }
            cmd.arg(host);
            cmd.args(&cfg.remote_command);
            Ok(cmd)
        }
        DriverKind::Rsh => {
            let mut cmd = Command::new(&cfg.rsh_program);
            cmd.arg(host);
            cmd.args(&cfg.remote_command);
            Ok(cmd)
        }
        DriverKind::Local => {
            let (program, args) = cfg
                .local_command
                .split_first()
                .ok_or_else(|| SecurityError::ChildSpawnFailed("empty local command".into()))?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        other => Err(SecurityError::Unsupported(other.name())),
    }
}

fn drop_privileges() -> std::io::Result<()> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    nix::unistd::setgid(gid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    nix::unistd::setuid(uid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Accept requests over our own stdio; used when the dispatcher runs as a
/// child of sshd/rshd or of a local driver parent.
pub fn accept_stdio(kind: DriverKind, _cfg: &SecurityConfig) -> Result<StreamAcceptor> {
    let (peer_name, peer_addr) = stdio_peer(kind)?;
    let (accept_tx, accept_rx) = mpsc::channel(8);
    let shared = establish(
        peer_name,
        Some(peer_addr),
        Side::Accept,
        tokio::io::stdin(),
        tokio::io::stdout(),
        Some(accept_tx),
    );
    Ok(StreamAcceptor::new(accept_rx, None, vec![Arc::clone(&shared)]))
}

/// Derive the peer identity for a stdio connection.  Under sshd the
/// `SSH_CONNECTION` variable carries `<peer-ip> <peer-port> <ip> <port>`.
fn stdio_peer(kind: DriverKind) -> Result<(String, IpAddr)> {
    if kind == DriverKind::Ssh {
        let value = std::env::var("SSH_CONNECTION").map_err(|_| {
            SecurityError::PeerUnauthenticated("SSH_CONNECTION is not set".into())
        })?;
        let ip_text = value.split_whitespace().next().ok_or_else(|| {
            SecurityError::PeerUnauthenticated("SSH_CONNECTION is empty".into())
        })?;
        let ip: IpAddr = ip_text.parse().map_err(|_| {
            SecurityError::PeerUnauthenticated(format!("bad SSH_CONNECTION address {ip_text}"))
        })?;
        Ok((ip.to_string(), ip))
    } else {
        Ok(("localhost".to_owned(), IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}
