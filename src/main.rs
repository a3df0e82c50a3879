//! lfs-gateway: content-addressed large-file server.
//!
//! SIGINT, SIGTERM and SIGHUP all stop the listener and drain in-flight
//! connections before exit.  Under a supervisor that passes the listening
//! socket as `fd://<n>`, SIGHUP is a zero-downtime restart: the new process
//! accepts on the inherited socket while this one drains.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lfs_gateway::config::{Config, LoggingConfig};
use lfs_gateway::listener::TrackingListener;

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(
    name = "lfs-gateway",
    version,
    about = "Content-addressed large-file server"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address (`tcp://host:port`, `fd://3`, ...).
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => lfs_gateway::config::load_config(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lfs-gateway: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging);

    if let Err(e) = run(config, cli.listen).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(mut config: Config, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    if config.observability.metrics {
        lfs_gateway::metrics::init_metrics()?;
        lfs_gateway::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let listen = config.server.listen.clone();
    let state = Arc::new(lfs_gateway::AppState::from_config(config)?);
    let app = lfs_gateway::server::app(state);

    let listener = TrackingListener::bind(&listen).await?;
    info!(listen = %listen, addr = ?listener.local_addr().ok(), "lfs-gateway listening");

    lfs_gateway::server::serve(listener, app, shutdown_signal()).await?;

    info!("lfs-gateway shut down");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let (terminate, hangup) = {
        use tokio::signal::unix::{signal, SignalKind};

        let wait_for = |kind: SignalKind| async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("failed to install signal handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        (
            wait_for(SignalKind::terminate()),
            wait_for(SignalKind::hangup()),
        )
    };

    #[cfg(not(unix))]
    let (terminate, hangup) = (
        std::future::pending::<()>(),
        std::future::pending::<()>(),
    );

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, draining"),
        _ = terminate => info!("Received SIGTERM, draining"),
        _ = hangup => info!("Received SIGHUP, draining for restart"),
    }
}
