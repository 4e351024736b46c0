//! `burrow client` — run the dial-back agent in front of a local backend.

use anyhow::Result;
use burrow_agent::AgentConfig;
use tokio::sync::watch;
use tracing::info;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    svr_addr: &str,
    backend_host: &str,
    backend_port: u16,
    pub_port: u16,
    int_port: u16,
    client_name: &str,
    share_public_port: bool,
    advertise_port: u16,
) -> Result<()> {
    let mut cfg = AgentConfig::new(svr_addr, backend_host, backend_port);
    cfg.display_name = client_name.to_string();
    cfg.public_port = pub_port;
    cfg.internal_port = int_port;
    cfg.share_public = share_public_port;
    cfg.advertise_port = advertise_port;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, stopping agent");
        let _ = stop_tx.send(true);
    });

    info!(
        server = %cfg.server_addr,
        backend = %format!("{backend_host}:{backend_port}"),
        "starting agent"
    );
    burrow_agent::run(cfg, stop_rx).await?;
    Ok(())
}
