//! `burrow users` — table of a session's public users with throughput.

use anyhow::{bail, Result};
use burrow_core::messages::{ControlRequest, ControlResponse};

pub async fn run(svr_addr: &str, client_name: &str) -> Result<()> {
    let response = burrow_agent::call(
        svr_addr,
        &ControlRequest::ListUsers {
            parent: client_name.to_string(),
        },
    )
    .await?;
    let users = match response {
        ControlResponse::Users(users) => users,
        ControlResponse::Error { code, message } => bail!("{code:?}: {message}"),
        other => bail!("unexpected response: {other:?}"),
    };

    println!("{:<22} {:<12} {}", "USER ADDRESS", "SPEED IN", "SPEED OUT");
    for u in &users {
        println!(
            "{:<22} {:<12} {}",
            u.user_addr,
            format_rate(u.rate_in),
            format_rate(u.rate_out)
        );
    }
    Ok(())
}

/// Render a bytes/sec figure with a binary-prefix unit.
fn format_rate(rate: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = rate;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_pick_sensible_units() {
        assert_eq!(format_rate(0.0), "0.0B/s");
        assert_eq!(format_rate(512.0), "512.0B/s");
        assert_eq!(format_rate(2048.0), "2.0KiB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.0MiB/s");
    }
}
