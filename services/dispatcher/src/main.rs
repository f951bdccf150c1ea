// backhaul-dispatcher: accepts backup service requests on this host.

use std::sync::Arc;

use tracing::info;

use dispatcher::{build_acceptor, cli, config, DispatcherContext, ServiceTable};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match cli::parse(&args) {
        Ok(cli::CliAction::Version) => {
            println!("backhaul-dispatcher {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Ok(cli::CliAction::Run(opts)) => opts,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let cfg = match &opts.config_file {
        Some(path) => config::load_config_from_path(path),
        None => config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let auth_name = opts.auth.clone().unwrap_or_else(|| cfg.general.auth.clone());
    let kind = match bh_security::DriverKind::from_token(&auth_name) {
        Ok(kind) => kind,
        Err(_) => {
            eprintln!("FATAL: no driver for security type '{auth_name}'");
            std::process::exit(1);
        }
    };

    let mut services = ServiceTable::default();
    if let Err(e) = services.apply_cli(&opts.services) {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }

    let security = cfg.security_config();
    let exit_when_idle = cfg.general.exit_when_idle && !opts.no_exit;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        driver = %auth_name,
        "dispatcher starting"
    );

    let acceptor = match build_acceptor(kind, &opts, &cfg, &security).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("FATAL: cannot listen: {e}");
            std::process::exit(1);
        }
    };
    if let Some(addr) = acceptor.local_addr() {
        info!(%addr, "listening");
    }

    let ctx = Arc::new(DispatcherContext { config: cfg, security, services, auth_name });
    let code = dispatcher::run(acceptor, ctx, exit_when_idle).await;
    std::process::exit(code);
}
