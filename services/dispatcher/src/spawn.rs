//! Service process spawning and file-descriptor placement.
//!
//! A dispatched service sees a fixed descriptor layout: the request on
//! stdin, the reply on stdout, stderr on 2, and one pipe pair per data
//! channel in the block starting at fd 50 (even fd: child writes toward
//! the network, odd fd: child reads from it).  The authenticated peer
//! name is exported as `AMANDA_AUTHENTICATED_PEER` (empty if unknown).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use bh_protocol::{DATA_CHANNEL_COUNT, DATA_FD_OFFSET};
use bh_security::SecurityError;

/// Parent ends of one data channel's pipe pair.
pub struct DataPipes {
    /// What the child writes toward the network.
    pub from_child: pipe::Receiver,
    /// What the network delivers for the child to read.
    pub to_child: pipe::Sender,
}

pub struct SpawnedService {
    pub child: Child,
    pub pid: u32,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Indexed by channel; entries are taken by the relay as the reply's
    /// CONNECT line names them.
    pub data: Vec<Option<DataPipes>>,
}

fn spawn_err(e: impl std::fmt::Display) -> SecurityError {
    SecurityError::ChildSpawnFailed(e.to_string())
}

/// Spawn `path` with the full descriptor layout in place.
pub fn spawn_service(path: &Path, auth: &str, peer: &str) -> Result<SpawnedService, SecurityError> {
    let mut mappings: Vec<(RawFd, RawFd)> = Vec::new();
    let mut child_ends: Vec<OwnedFd> = Vec::new();
    let mut data = Vec::new();

    for i in 0..DATA_CHANNEL_COUNT {
        // One pipe per direction; CLOEXEC everywhere, the dup2 into the
        // advertised slot is what survives the exec.
        let (to_child_read, to_child_write) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_err)?;
        let (from_child_read, from_child_write) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_err)?;
        let base = DATA_FD_OFFSET as RawFd + 2 * i as RawFd;
        mappings.push((from_child_write.as_raw_fd(), base));
        mappings.push((to_child_read.as_raw_fd(), base + 1));
        child_ends.push(from_child_write);
        child_ends.push(to_child_read);
        data.push(Some(DataPipes {
            from_child: pipe::Receiver::from_owned_fd(from_child_read).map_err(spawn_err)?,
            to_child: pipe::Sender::from_owned_fd(to_child_write).map_err(spawn_err)?,
        }));
    }

    let mut cmd = Command::new(path);
    cmd.arg(auth)
        .env("AMANDA_AUTHENTICATED_PEER", peer)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    let map = mappings.clone();
    unsafe {
        cmd.pre_exec(move || place_fds(&map));
    }

    let mut child = cmd.spawn().map_err(spawn_err)?;
    // The child ends live on as fds 50.. in the child; our copies close.
    drop(child_ends);

    let pid = child.id().unwrap_or_default();
    let stdin = child.stdin.take().ok_or_else(|| spawn_err("no stdin pipe"))?;
    let stdout = child.stdout.take().ok_or_else(|| spawn_err("no stdout pipe"))?;
    let stderr = child.stderr.take().ok_or_else(|| spawn_err("no stderr pipe"))?;

    Ok(SpawnedService { child, pid, stdin, stdout, stderr, data })
}

/// Runs between fork and exec: only async-signal-safe calls allowed.
fn place_fds(map: &[(RawFd, RawFd)]) -> std::io::Result<()> {
    let lo = DATA_FD_OFFSET as RawFd;
    let hi = lo + (DATA_CHANNEL_COUNT as RawFd) * 2;

    // Move any source fd that happens to sit inside the target window out
    // of the way, or a later dup2 would clobber it.
    let mut sources: Vec<RawFd> = map.iter().map(|(src, _)| *src).collect();
    for src in &mut sources {
        while *src >= lo && *src < hi {
            let moved = unsafe { libc::dup(*src) };
            if moved < 0 {
                return Err(std::io::Error::last_os_error());
            }
            *src = moved;
        }
    }

    for ((_, dst), src) in map.iter().zip(sources) {
        if unsafe { libc::dup2(src, *dst) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
