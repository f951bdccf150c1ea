//! Driver-tunable configuration.
//!
//! One explicit struct replaces the per-key config callback of older
//! dispatchers: drivers receive a borrowed [`SecurityConfig`] and read
//! exactly the knobs they care about.

use std::path::PathBuf;
use std::time::Duration;

/// Default dispatcher port, both UDP (datagram family) and TCP/TLS.
pub const DEFAULT_SERVICE_PORT: u16 = 10080;

/// Seconds between connect attempts.
pub const CONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Refuse datagram REQs and stream connections from unprivileged
    /// source ports.  Tests bind ephemeral ports and turn this off.
    pub require_reserved_peer_port: bool,
    /// Bind outgoing sockets to a reserved source port when the process
    /// has (or can briefly regain) the privilege to do so.
    pub bind_reserved_port: bool,
    /// Port range walked when a reserved port is wanted.
    pub reserved_port_range: (u16, u16),
    /// Port the remote dispatcher listens on.
    pub service_port: u16,
    pub connect_timeout: Duration,
    pub connect_tries: u32,
    /// User name asserted in datagram REQ bodies; defaults to the local
    /// login user.
    pub auth_user: Option<String>,
    /// Override for the peer-authorization hosts file (defaults to
    /// `.amandahosts` in the local login user's home directory).
    pub hosts_file: Option<PathBuf>,
    pub tls: TlsConfig,
    /// Remote-shell programs and the command they should run remotely.
    pub ssh_program: PathBuf,
    pub rsh_program: PathBuf,
    pub remote_command: Vec<String>,
    /// Dispatcher binary exec'd directly by the `local` driver.
    pub local_command: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> SecurityConfig {
        SecurityConfig {
            require_reserved_peer_port: true,
            bind_reserved_port: true,
            reserved_port_range: (512, 1023),
            service_port: DEFAULT_SERVICE_PORT,
            connect_timeout: Duration::from_secs(20),
            connect_tries: 3,
            auth_user: None,
            hosts_file: None,
            tls: TlsConfig::default(),
            ssh_program: PathBuf::from("ssh"),
            rsh_program: PathBuf::from("rsh"),
            remote_command: vec!["backhaul-dispatcher".into(), "-auth=ssh".into()],
            local_command: vec!["backhaul-dispatcher".into(), "-auth=local".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// CA bundle the peer's chain must verify against (depth <= 1).
    /// When unset, chain verification is skipped and only the presence,
    /// hostname and fingerprint checks apply.
    pub ca_file: Option<PathBuf>,
    /// Allow-list of `MD5 Fingerprint=`/`SHA1 Fingerprint=` lines.
    pub fingerprint_file: Option<PathBuf>,
    /// Restrict the cipher-suite set to suites whose name contains one of
    /// these tokens (case-insensitive).  Empty means the default set.
    pub cipher_list: Vec<String>,
    /// Verify that the certificate CN resolves to the peer address.
    pub check_certificate_host: bool,
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig {
            cert_file: None,
            key_file: None,
            ca_file: None,
            fingerprint_file: None,
            cipher_list: Vec::new(),
            check_certificate_host: true,
        }
    }
}
