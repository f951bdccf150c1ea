//! In-process dispatcher harness.
//!
//! Starts a real dispatcher on an ephemeral port with a temp libexec
//! directory and a correctly-permissioned hosts file, and hands back the
//! matching client-side [`SecurityConfig`].  Reserved-port requirements
//! are off on both sides; everything else is the production path.

use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use bh_security::{hostauth, DriverKind, ListenMode, SecurityConfig};
use dispatcher::{DispatcherConfig, DispatcherContext, ServiceTable};

pub struct DispatcherHarness {
    pub addr: SocketAddr,
    pub kind: DriverKind,
    /// Temp libexec directory; drop scripts for fake services in here.
    pub libexec: TempDir,
    config: DispatcherConfig,
    _auth_dir: TempDir,
    _task: JoinHandle<i32>,
}

impl DispatcherHarness {
    /// Start a dispatcher for `kind` with the default-active services
    /// plus `extra_services` enabled.  `tweak` may adjust the config
    /// (TLS paths and the like) before the listener binds.
    pub async fn start(
        kind: DriverKind,
        extra_services: &[&str],
        tweak: impl FnOnce(&mut DispatcherConfig),
    ) -> DispatcherHarness {
        let libexec = tempfile::tempdir().expect("libexec tempdir");
        let auth_dir = tempfile::tempdir().expect("auth tempdir");
        let hosts_file = write_hosts_file(auth_dir.path());

        let mut config = DispatcherConfig::default();
        config.net.require_reserved_peer_port = false;
        config.net.bind_reserved_port = false;
        config.general.libexec_dir = libexec.path().to_path_buf();
        config.general.auth = kind.name().to_owned();
        config.auth.hosts_file = Some(hosts_file);
        tweak(&mut config);

        let mut services = ServiceTable::default();
        services
            .apply_cli(&extra_services.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .expect("enable extra services");

        let security = config.security_config();
        let mode = match kind {
            DriverKind::Bsd | DriverKind::BsdUdp => ListenMode::Udp(Some(0)),
            _ => ListenMode::Tcp(0),
        };
        let acceptor = bh_security::listen(kind, mode, &security)
            .await
            .expect("bind dispatcher listener");
        let addr = acceptor.local_addr().expect("listener address");

        let ctx = Arc::new(DispatcherContext {
            config: config.clone(),
            security,
            services,
            auth_name: kind.name().to_owned(),
        });
        let task = tokio::spawn(dispatcher::run(acceptor, ctx, false));

        DispatcherHarness { addr, kind, libexec, config, _auth_dir: auth_dir, _task: task }
    }

    /// A client configuration that reaches this dispatcher.
    pub fn client_config(&self) -> SecurityConfig {
        SecurityConfig {
            require_reserved_peer_port: false,
            bind_reserved_port: false,
            service_port: self.addr.port(),
            tls: self.config.security_config().tls,
            ..SecurityConfig::default()
        }
    }

    /// Drop a fake service script into the harness libexec.
    pub fn write_service(&self, name: &str, body: &str) {
        crate::scripts::write_service_script(self.libexec.path(), name, body);
    }
}

/// A hosts file authorizing the local user for every catalog service from
/// loopback peers, with the ownership and mode the check demands.
fn write_hosts_file(dir: &Path) -> std::path::PathBuf {
    let user = hostauth::local_user_name().unwrap_or_else(|| "root".to_owned());
    let path = dir.join(".amandahosts");
    let line = format!(
        "localhost {user} noop,selfcheck,sendsize,sendbackup,amindexd,amidxtaped,amdumpd\n"
    );
    fs::write(&path, line).expect("write hosts file");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
        .expect("restrict hosts file mode");
    path
}
