//! `burrow lan` — plain local pass-through proxy.
//!
//! Accepts on a local port and splices each connection straight to the
//! remote address. No rendezvous server, no tokens; useful on a LAN where
//! the backend is directly reachable.

use anyhow::{Context, Result};
use burrow_core::pair::ConnPair;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub async fn run(local_port: u16, remote_host: &str, remote_port: u16) -> Result<()> {
    let local_addr = format!("0.0.0.0:{local_port}");
    let remote_addr = format!("{remote_host}:{remote_port}");

    let listener = TcpListener::bind(&local_addr)
        .await
        .with_context(|| format!("cannot listen on {local_addr}"))?;
    info!(local = %local_addr, remote = %remote_addr, "pass-through proxy ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping proxy");
                return Ok(());
            }
            result = listener.accept() => {
                let (client, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let remote_addr = remote_addr.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&remote_addr).await {
                        Ok(remote) => {
                            info!(peer = %peer, remote = %remote_addr, "proxying connection");
                            ConnPair::new(client, remote).label(peer.to_string()).spawn();
                        }
                        Err(e) => {
                            warn!(peer = %peer, remote = %remote_addr, error = %e, "remote dial failed");
                        }
                    }
                });
            }
        }
    }
}
