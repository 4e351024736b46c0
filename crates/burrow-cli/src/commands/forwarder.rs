//! `burrow forwarder` — start the server-side HTTP forwarder service.

use anyhow::{bail, Result};
use burrow_core::messages::{ControlRequest, ControlResponse};

pub async fn run(svr_addr: &str, pub_port: u16) -> Result<()> {
    let response = burrow_agent::call(
        svr_addr,
        &ControlRequest::StartService {
            kind: "l7forwarder".to_string(),
            public_port: pub_port,
        },
    )
    .await?;
    match response {
        ControlResponse::ServiceStarted(info) => {
            println!("new forwarder {}({}) created", info.id, info.addr);
            Ok(())
        }
        ControlResponse::Error { code, message } => bail!("{code:?}: {message}"),
        other => bail!("unexpected response: {other:?}"),
    }
}
