//! courier-server: presence-aware direct-message relay.
//!
//! Accepts line-delimited JSON connections, authenticates clients, publishes
//! their messages to a bus and routes bus traffic to live sessions or to
//! storage for backlog replay.

mod bus;
mod config;
mod connection;
mod handshake;
mod relay;
mod server;
mod session;
mod store;
mod transport;

use anyhow::{bail, Context};
use bus::{Bus, MemoryBus};
use clap::Parser;
use config::{CliOverrides, ServerConfig, StoreKind};
use server::GatewayServer;
use std::path::PathBuf;
use std::sync::Arc;
use store::{MemoryStore, SqliteStore, Store};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// courier-server: direct-message relay
#[derive(Parser, Debug)]
#[command(name = "courier-server", version, about = "Presence-aware message relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.courier/config.toml")]
    config: String,

    /// Store url (`memory` or `sqlite:<path>`)
    #[arg(long)]
    store: Option<String>,

    /// Bus topic
    #[arg(long)]
    topic: Option<String>,

    /// Bus endpoint (only `memory` is built in)
    #[arg(long)]
    bus: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        listen_addr: cli.listen,
        port: cli.port,
        store_url: cli.store,
        bus_endpoint: cli.bus,
        topic: cli.topic,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.bind_addr(),
        "starting courier-server"
    );

    let (store, bus, listener) = match startup(&server_config).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %format!("{e:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let server = GatewayServer::new(server_config, store, bus);
    if let Err(e) = server.run(listener, shutdown_rx).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("courier-server stopped");
}

/// Open the collaborators and bind the listener. Any failure here is fatal.
async fn startup(
    config: &ServerConfig,
) -> anyhow::Result<(Arc<dyn Store>, Arc<dyn Bus>, TcpListener)> {
    let store: Arc<dyn Store> = match &config.store {
        StoreKind::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Sqlite(path) => {
            info!(path = %path.display(), "opening sqlite store");
            Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("cannot open store {}", path.display()))?,
            )
        }
    };

    if config.bus_endpoint != "memory" {
        bail!("unsupported bus endpoint: {}", config.bus_endpoint);
    }
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new(&config.topic));

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    Ok((store, bus, listener))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
