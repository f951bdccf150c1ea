//! Peer authorization against the local user's `.amandahosts` file.
//!
//! A peer `(hostname, user, service)` is authorized when a line of the
//! file matches all three.  The file must belong to the local login user
//! and must not be group/world accessible; a missing or misowned file is
//! a denial, never a silent pass.
//!
//! Line grammar, `#` comments allowed:
//!
//! ```text
//! <host> [<user> [<service>[,<service>]...]]
//! ```
//!
//! Host comparison is case-insensitive; `localhost` and
//! `localhost.localdomain` lines match only peers connecting from a
//! loopback address.  A missing user field defaults to the local login
//! user; a missing service list defaults to the amdump set.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{getuid, User};
use tracing::debug;

use crate::config::SecurityConfig;

/// Services a bare host/user line (or the `amdump` alias) authorizes.
pub const DEFAULT_SERVICES: [&str; 4] = ["noop", "selfcheck", "sendsize", "sendbackup"];

/// The peer identity being checked.
#[derive(Debug, Clone, Copy)]
pub struct Peer<'a> {
    pub hostname: &'a str,
    pub addr: IpAddr,
    /// User name the peer asserted; empty means the local login user.
    pub remote_user: &'a str,
    pub service: &'a str,
}

/// Check a peer against the hosts file.  `Err` carries the human-readable
/// denial text that ends up in the NAK body.
pub fn check(cfg: &SecurityConfig, peer: Peer<'_>) -> Result<(), String> {
    let local = local_user()?;
    let path = match &cfg.hosts_file {
        Some(p) => p.clone(),
        None => local.home.join(".amandahosts"),
    };
    check_file(&path, local.uid, &local.name, peer)
}

/// The local login user name, when it can be determined at all.
pub fn local_user_name() -> Option<String> {
    local_user().ok().map(|u| u.name)
}

pub(crate) struct LocalUser {
    pub uid: u32,
    pub name: String,
    pub home: PathBuf,
}

pub(crate) fn local_user() -> Result<LocalUser, String> {
    let uid = getuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => Ok(LocalUser {
            uid: uid.as_raw(),
            name: user.name,
            home: user.dir,
        }),
        _ => {
            // Stripped-down environments can lack a passwd entry; fall back
            // to the login name from the environment and $HOME.
            let name = std::env::var("LOGNAME")
                .or_else(|_| std::env::var("USER"))
                .map_err(|_| format!("cannot look up local user for uid {}", uid.as_raw()))?;
            let home = dirs::home_dir()
                .ok_or_else(|| format!("no home directory for user {name}"))?;
            Ok(LocalUser { uid: uid.as_raw(), name, home })
        }
    }
}

fn check_file(path: &Path, local_uid: u32, local_name: &str, peer: Peer<'_>) -> Result<(), String> {
    let meta = fs::metadata(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    if meta.uid() != local_uid {
        return Err(format!(
            "{} is not owned by uid {local_uid}",
            path.display()
        ));
    }
    if meta.mode() & 0o077 != 0 {
        return Err(format!(
            "{} is group/world accessible (mode {:04o})",
            path.display(),
            meta.mode() & 0o7777
        ));
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    let want_user = if peer.remote_user.is_empty() { local_name } else { peer.remote_user };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(host) = fields.next() else { continue };
        if !host_matches(host, peer.hostname, peer.addr) {
            continue;
        }
        let user = fields.next().unwrap_or(local_name);
        if !user.eq_ignore_ascii_case(want_user) {
            continue;
        }
        let services: Vec<&str> = match fields.next() {
            Some(list) => list.split(',').collect(),
            None => DEFAULT_SERVICES.to_vec(),
        };
        if service_matches(&services, peer.service) {
            debug!(host, user, service = peer.service, "hosts-file entry matched");
            return Ok(());
        }
    }

    Err(format!(
        "host {} user {} is not allowed to execute the service {}",
        peer.hostname, want_user, peer.service
    ))
}

fn host_matches(entry: &str, peer_host: &str, peer_addr: IpAddr) -> bool {
    if entry.eq_ignore_ascii_case("localhost")
        || entry.eq_ignore_ascii_case("localhost.localdomain")
    {
        return peer_addr.is_loopback();
    }
    entry.eq_ignore_ascii_case(peer_host)
}

fn service_matches(entries: &[&str], service: &str) -> bool {
    entries.iter().any(|e| {
        if e.eq_ignore_ascii_case("amdump") {
            DEFAULT_SERVICES.contains(&service)
        } else {
            e.eq_ignore_ascii_case(service)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_hosts(dir: &tempfile::TempDir, mode: u32, contents: &str) -> PathBuf {
        let path = dir.path().join(".amandahosts");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn peer<'a>(host: &'a str, service: &'a str) -> Peer<'a> {
        Peer {
            hostname: host,
            addr: "127.0.0.1".parse().unwrap(),
            remote_user: "backup",
            service,
        }
    }

    #[test]
    fn exact_host_user_service_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "tapeserver.example.com backup sendbackup,sendsize\n");
        let me = getuid().as_raw();
        let ok = check_file(&path, me, "amanda", peer("TAPESERVER.example.com", "sendsize"));
        assert!(ok.is_ok());
        let denied = check_file(&path, me, "amanda", peer("tapeserver.example.com", "selfcheck"));
        assert!(denied.is_err());
    }

    #[test]
    fn bare_host_line_gets_default_services() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "tapeserver backup\n");
        let me = getuid().as_raw();
        for svc in DEFAULT_SERVICES {
            assert!(check_file(&path, me, "amanda", peer("tapeserver", svc)).is_ok());
        }
        assert!(check_file(&path, me, "amanda", peer("tapeserver", "amindexd")).is_err());
    }

    #[test]
    fn amdump_alias_expands() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "tapeserver backup amdump\n");
        let me = getuid().as_raw();
        assert!(check_file(&path, me, "amanda", peer("tapeserver", "sendbackup")).is_ok());
        assert!(check_file(&path, me, "amanda", peer("tapeserver", "amidxtaped")).is_err());
    }

    #[test]
    fn localhost_requires_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "localhost backup\n");
        let me = getuid().as_raw();
        assert!(check_file(&path, me, "amanda", peer("anything", "noop")).is_ok());
        let remote = Peer {
            hostname: "localhost",
            addr: "192.0.2.9".parse().unwrap(),
            remote_user: "backup",
            service: "noop",
        };
        assert!(check_file(&path, me, "amanda", remote).is_err());
    }

    #[test]
    fn loose_mode_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o644, "localhost backup\n");
        let me = getuid().as_raw();
        let err = check_file(&path, me, "amanda", peer("localhost", "noop")).unwrap_err();
        assert!(err.contains("accessible"), "unexpected denial: {err}");
    }

    #[test]
    fn missing_file_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".amandahosts");
        let me = getuid().as_raw();
        assert!(check_file(&path, me, "amanda", peer("localhost", "noop")).is_err());
    }

    #[test]
    fn wrong_owner_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "localhost backup\n");
        let err = check_file(&path, getuid().as_raw() + 1, "amanda", peer("localhost", "noop"))
            .unwrap_err();
        assert!(err.contains("not owned"), "unexpected denial: {err}");
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "# comment\n\nlocalhost backup noop\n");
        let me = getuid().as_raw();
        assert!(check_file(&path, me, "amanda", peer("localhost", "noop")).is_ok());
    }

    #[test]
    fn empty_remote_user_defaults_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hosts(&dir, 0o600, "localhost amanda noop\n");
        let me = getuid().as_raw();
        let anon = Peer {
            hostname: "localhost",
            addr: "::1".parse().unwrap(),
            remote_user: "",
            service: "noop",
        };
        assert!(check_file(&path, me, "amanda", anon).is_ok());
    }
}
