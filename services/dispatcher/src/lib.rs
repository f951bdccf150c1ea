//! dispatcher: the per-host service dispatcher.
//!
//! Listens for requests over a configured security driver, authenticates
//! and authorizes each peer, spawns the requested backup service with the
//! fixed descriptor layout, and relays its reply and data channels back
//! to the server.  One task per request; the process exits on idleness
//! unless told otherwise.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use bh_security::{Acceptor, DriverKind, ListenMode, SecurityConfig, SecurityError};

pub mod cli;
pub mod config;
pub mod service;
pub mod spawn;

pub use cli::{CliAction, CliOptions};
pub use config::DispatcherConfig;
pub use service::ServiceTable;

/// How often the idle check runs; the process exits when a check finds
/// the request queue empty.
const IDLE_CHECK: Duration = Duration::from_secs(30);

/// Everything a request task needs, built once at startup.
pub struct DispatcherContext {
    pub config: DispatcherConfig,
    pub security: SecurityConfig,
    pub services: ServiceTable,
    /// Token of the driver in use, passed to spawned services.
    pub auth_name: String,
}

/// Resolve the listening mode from CLI overrides and configuration.
pub async fn build_acceptor(
    kind: DriverKind,
    opts: &CliOptions,
    cfg: &DispatcherConfig,
    sec: &SecurityConfig,
) -> Result<Acceptor, SecurityError> {
    let mode = if let Some(port) = opts.udp_port {
        ListenMode::Udp(Some(port))
    } else if let Some(port) = opts.tcp_port {
        ListenMode::Tcp(port)
    } else {
        match kind {
            DriverKind::Bsd | DriverKind::BsdUdp => ListenMode::Udp(Some(cfg.net.udp_port)),
            DriverKind::BsdTcp | DriverKind::Ssl => ListenMode::Tcp(cfg.net.tcp_port),
            DriverKind::Rsh | DriverKind::Ssh | DriverKind::Local => ListenMode::Stdio,
        }
    };
    bh_security::listen(kind, mode, sec).await
}

/// Serve requests until the acceptor closes or the idle timer fires.
/// Returns the process exit code.
pub async fn run(mut acceptor: Acceptor, ctx: Arc<DispatcherContext>, exit_when_idle: bool) -> i32 {
    let active = Arc::new(AtomicUsize::new(0));
    let mut idle = tokio::time::interval(IDLE_CHECK);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    idle.tick().await; // the immediate first tick is not an idle period

    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok((handle, request)) => {
                    debug!(peer = handle.peer_name(), "request accepted");
                    active.fetch_add(1, Ordering::SeqCst);
                    let task_ctx = Arc::clone(&ctx);
                    let task_active = Arc::clone(&active);
                    tokio::spawn(async move {
                        service::handle_request(task_ctx, handle, request).await;
                        task_active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(SecurityError::PeerEof) => {
                    // Stdio transports end here when the connection does.
                    debug!("request source closed");
                    drain(&active).await;
                    return 0;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    drain(&active).await;
                    return 1;
                }
            },
            _ = idle.tick() => {
                if exit_when_idle && active.load(Ordering::SeqCst) == 0 {
                    info!("no active requests, exiting");
                    return 0;
                }
            }
        }
    }
}

/// Let in-flight requests finish before the process exits.
async fn drain(active: &AtomicUsize) {
    while active.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
