//! `burrow list` — table of live client sessions.

use anyhow::{bail, Result};
use burrow_core::messages::{ControlRequest, ControlResponse};

pub async fn run(svr_addr: &str) -> Result<()> {
    let response = burrow_agent::call(svr_addr, &ControlRequest::ListClients).await?;
    let ControlResponse::Clients(clients) = response else {
        bail!("unexpected response: {response:?}");
    };

    println!(
        "{:<34} {:<16} {:<22} {:<22} {}",
        "ID", "DISPLAY NAME", "PUBLIC ADDRESS", "INTERNAL ADDRESS", "MODE"
    );
    for c in &clients {
        let mode = if c.direct {
            "direct"
        } else if c.share_public {
            "shared"
        } else {
            "tunnel"
        };
        println!(
            "{:<34} {:<16} {:<22} {:<22} {}",
            c.id, c.display_name, c.public_addr, c.internal_addr, mode
        );
    }
    Ok(())
}
