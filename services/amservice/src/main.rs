// amservice: run one service on a remote dispatcher and print its reply.
//
// The operator's hammer for poking a host: picks a driver, submits a
// single request, streams partial replies to stderr as they arrive, and
// exits non-zero when the host refuses or the exchange fails.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::debug;

use bh_protocol::ServiceRequest;
use bh_security::{client, DriverKind, RequestOptions, SecurityConfig};

#[derive(Debug, Parser)]
#[command(name = "amservice", version, about = "Submit one request to a remote dispatcher")]
struct Args {
    /// Host to contact.
    host: String,
    /// Security driver: bsd, bsdudp, bsdtcp, rsh, ssh, local, ssl.
    auth: String,
    /// Service to run (noop, sendsize, selfcheck, ...).
    service: String,
    /// File with additional request body lines after the SERVICE line.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Dispatcher port on the remote host.
    #[arg(long, default_value_t = bh_security::DEFAULT_SERVICE_PORT)]
    port: u16,
    /// Seconds to wait for the reply.
    #[arg(long, default_value_t = 600)]
    timeout: u64,
    /// Do not bind a reserved source port (debugging against test hosts).
    #[arg(long)]
    unprivileged: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let kind = match DriverKind::from_token(&args.auth) {
        Ok(kind) => kind,
        Err(_) => {
            eprintln!("amservice: no driver for security type '{}'", args.auth);
            std::process::exit(1);
        }
    };

    let extra = match &args.file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("amservice: cannot read {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => String::new(),
    };
    let req_body = ServiceRequest::format(&args.service, "", &extra);

    let cfg = SecurityConfig {
        service_port: args.port,
        bind_reserved_port: !args.unprivileged,
        ..SecurityConfig::default()
    };
    let opts = RequestOptions {
        rep_wait: Duration::from_secs(args.timeout),
        ..RequestOptions::default()
    };

    let (partial_tx, mut partial_rx) = tokio::sync::mpsc::channel::<String>(8);
    let printer = tokio::spawn(async move {
        while let Some(partial) = partial_rx.recv().await {
            eprint!("{partial}");
        }
    });

    match client::request(kind, &args.host, &cfg, &req_body, &opts, Some(partial_tx)).await {
        Ok((mut handle, reply)) => {
            debug!(peer = handle.peer_name(), "exchange complete");
            handle.close();
            let _ = printer.await;
            if reply.is_nak() {
                eprint!("amservice: request refused: {}", reply.body);
                std::process::exit(1);
            }
            print!("{}", reply.body);
        }
        Err(e) => {
            eprintln!("amservice: {e}");
            std::process::exit(1);
        }
    }
}
