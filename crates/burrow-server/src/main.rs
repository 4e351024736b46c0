//! burrow-server: rendezvous server for the burrow tunnel.
//!
//! Accepts control connections from client agents, opens public listeners
//! on their behalf, and splices public users through to the agents'
//! backends via token-paired dial-backs.

mod config;
mod listener;
mod server;
mod service;
mod session;

use clap::Parser;
use config::ServerConfig;
use listener::ListenerRegistry;
use server::RelayServer;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

/// burrow-server — rendezvous server
#[derive(Parser, Debug)]
#[command(name = "burrow-server", version, about = "burrow rendezvous server")]
struct Cli {
    /// Control listener address
    #[arg(long = "ctl_addr")]
    ctl_addr: Option<String>,

    /// Public host ip address or hostname advertised to agents
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.burrow/server.toml")]
    config: String,

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
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.ctl_addr.as_deref(),
        cli.host.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ctl_addr = %config.ctl_addr,
        host = %config.host,
        "starting burrow-server"
    );

    let control = match TcpListener::bind(&config.ctl_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.ctl_addr, error = %e, "failed to bind control listener");
            std::process::exit(1);
        }
    };

    let server = RelayServer::new(config.host, ListenerRegistry::new());

    tokio::select! {
        result = server.run(control) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("burrow-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
