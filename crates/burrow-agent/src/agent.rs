//! The dial-back worker.
//!
//! Maintains the control stream to the server, reconnecting with a fixed
//! backoff while the server is unavailable, and bridges each pairing event:
//! dial the internal address, present the token, dial the real backend,
//! splice. Only a caller-initiated stop ends the agent.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use burrow_core::error::{BurrowError, BurrowResult};
use burrow_core::messages::{ClientEvent, ControlRequest, ControlResponse, ErrorCode};
use burrow_core::pair::ConnPair;
use burrow_core::token::TOKEN_LEN;

use crate::control::ControlStream;

/// Configuration for one agent run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control address of the rendezvous server.
    pub server_addr: String,
    /// Display name reported on registration.
    pub display_name: String,
    /// Desired public port, 0 = server/OS picks.
    pub public_port: u16,
    /// Desired internal port, 0 = server/OS picks.
    pub internal_port: u16,
    /// Share the public port with other opted-in sessions.
    pub share_public: bool,
    /// The real backend this agent fronts.
    pub backend_host: String,
    pub backend_port: u16,
    /// Port advertised for the server's direct-connect probe;
    /// 0 = use `backend_port`.
    pub advertise_port: u16,
    /// Delay between reconnect attempts while the server is unavailable.
    pub reconnect_delay: Duration,
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, backend_host: impl Into<String>, backend_port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            display_name: "unknown".into(),
            public_port: 0,
            internal_port: 0,
            share_public: false,
            backend_host: backend_host.into(),
            backend_port,
            advertise_port: 0,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    fn probe_port(&self) -> u16 {
        if self.advertise_port != 0 {
            self.advertise_port
        } else {
            self.backend_port
        }
    }
}

/// Run the agent until `stop` fires. Reconnects indefinitely on an
/// unavailable server; any other failure is terminal.
pub async fn run(cfg: AgentConfig, mut stop: watch::Receiver<bool>) -> BurrowResult<()> {
    // Pinned across reconnects so the session keeps its public port.
    let mut public_port = cfg.public_port;

    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let connected = tokio::select! {
            _ = stop.changed() => return Ok(()),
            result = ControlStream::connect(&cfg.server_addr) => result,
        };
        let mut control = match connected {
            Ok(control) => control,
            Err(BurrowError::Unavailable(reason)) => {
                info!(
                    delay_secs = cfg.reconnect_delay.as_secs_f64(),
                    "server unavailable, reconnecting: {reason}"
                );
                tokio::select! {
                    _ = stop.changed() => return Ok(()),
                    _ = tokio::time::sleep(cfg.reconnect_delay) => continue,
                }
            }
            Err(e) => return Err(e),
        };

        let request = ControlRequest::CreateClient {
            display_name: cfg.display_name.clone(),
            public_port,
            internal_port: cfg.internal_port,
            share_public: cfg.share_public,
            protocol: "tcp".into(),
            backend_port: cfg.probe_port(),
        };
        if let Err(e) = control.send(&request).await {
            warn!(error = %e, "registration failed, reconnecting");
            continue;
        }

        match serve_events(&cfg, &mut control, &mut public_port, &mut stop).await {
            EventOutcome::Stopped => return Ok(()),
            EventOutcome::StreamEnded => {
                warn!("control stream ended, reconnecting");
            }
            EventOutcome::Fatal(e) => return Err(e),
        }
    }
}

enum EventOutcome {
    Stopped,
    StreamEnded,
    Fatal(BurrowError),
}

/// Consume the event stream until it ends or the agent is stopped.
async fn serve_events(
    cfg: &AgentConfig,
    control: &mut ControlStream,
    public_port: &mut u16,
    stop: &mut watch::Receiver<bool>,
) -> EventOutcome {
    loop {
        let response = tokio::select! {
            _ = stop.changed() => return EventOutcome::Stopped,
            response = control.next() => response,
        };
        match response {
            Ok(Some(ControlResponse::Event(ClientEvent::Bootstrap {
                public_addr,
                share_public,
            }))) => {
                println!("PUBLIC ADDRESS: {public_addr}");
                debug!(public_addr = %public_addr, share_public, "bootstrapped");
                if let Some(port) = public_addr
                    .rsplit(':')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                {
                    *public_port = port;
                }
            }
            Ok(Some(ControlResponse::Event(ClientEvent::Pairing {
                token,
                internal_addr,
                ..
            }))) => {
                let backend_addr = cfg.backend_addr();
                tokio::spawn(async move {
                    if let Err(e) = bridge(&internal_addr, &token, &backend_addr).await {
                        warn!(token = %token, error = %e, "dial-back failed");
                    }
                });
            }
            Ok(Some(ControlResponse::Error { code, message })) => {
                return EventOutcome::Fatal(match code {
                    ErrorCode::BindFailed => BurrowError::Other(format!("bind failed: {message}")),
                    _ => BurrowError::Other(message),
                });
            }
            Ok(Some(other)) => {
                debug!(?other, "ignoring unexpected control response");
            }
            Ok(None) => return EventOutcome::StreamEnded,
            Err(e) => {
                debug!(error = %e, "control stream error");
                return EventOutcome::StreamEnded;
            }
        }
    }
}

/// Bridge one pairing: internal dial, exact token write, backend dial,
/// splice. The pair then lives on its own; transport errors end it.
async fn bridge(internal_addr: &str, token: &str, backend_addr: &str) -> BurrowResult<()> {
    if token.len() != TOKEN_LEN {
        return Err(BurrowError::Protocol(format!(
            "token has wrong length: {token:?}"
        )));
    }

    let mut internal = TcpStream::connect(internal_addr).await?;
    internal.write_all(token.as_bytes()).await?;

    let backend = match TcpStream::connect(backend_addr).await {
        Ok(backend) => backend,
        Err(e) => {
            // Dropping the internal socket tells the server this pairing
            // is dead.
            drop(internal);
            return Err(e.into());
        }
    };
    debug!(token = %token, backend = %backend_addr, "bridged to backend");

    ConnPair::new(internal, backend)
        .label(format!("token {token}"))
        .spawn();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::codec::{read_frame, write_frame};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(server_addr: String, backend_port: u16) -> AgentConfig {
        let mut cfg = AgentConfig::new(server_addr, "127.0.0.1", backend_port);
        cfg.display_name = "agent-under-test".into();
        cfg.reconnect_delay = Duration::from_millis(50);
        cfg
    }

    async fn echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn registers_and_bridges_pairings() {
        let backend_port = echo_backend().await;

        // Mock rendezvous server: one control connection, one internal
        // listener expecting the dial-back.
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_listener.local_addr().unwrap().to_string();
        let internal_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let internal_addr = internal_listener.local_addr().unwrap().to_string();

        let (stop_tx, stop_rx) = watch::channel(false);
        let cfg = test_config(control_addr, backend_port);
        let agent = tokio::spawn(run(cfg, stop_rx));

        let (mut control, _) = control_listener.accept().await.unwrap();
        let request: Option<ControlRequest> = read_frame(&mut control).await.unwrap();
        let Some(ControlRequest::CreateClient {
            display_name,
            backend_port: probe,
            ..
        }) = request
        else {
            panic!("expected CreateClient, got {request:?}");
        };
        assert_eq!(display_name, "agent-under-test");
        assert_eq!(probe, backend_port);

        write_frame(
            &mut control,
            &ControlResponse::Event(ClientEvent::Bootstrap {
                public_addr: "127.0.0.1:7777".into(),
                share_public: false,
            }),
        )
        .await
        .unwrap();
        write_frame(
            &mut control,
            &ControlResponse::Event(ClientEvent::Pairing {
                session_id: "s1".into(),
                token: "0001".into(),
                internal_addr: internal_addr.clone(),
                public_addr: "127.0.0.1:7777".into(),
                display_name: "agent-under-test".into(),
            }),
        )
        .await
        .unwrap();

        // The agent dials back, presents the token, and splices us through
        // to the echo backend.
        let (mut tunnel, _) = internal_listener.accept().await.unwrap();
        let mut token = [0u8; TOKEN_LEN];
        tunnel.read_exact(&mut token).await.unwrap();
        assert_eq!(&token, b"0001");

        tunnel.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");

        stop_tx.send(true).unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnects_until_server_appears() {
        let backend_port = echo_backend().await;

        // Reserve a port, then leave it dead for a while.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = placeholder.local_addr().unwrap().to_string();
        drop(placeholder);

        let (stop_tx, stop_rx) = watch::channel(false);
        let cfg = test_config(control_addr.clone(), backend_port);
        let agent = tokio::spawn(run(cfg, stop_rx));

        // Let the agent fail a few attempts, then come up.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let control_listener = TcpListener::bind(&control_addr).await.unwrap();
        let (mut control, _) = tokio::time::timeout(
            Duration::from_secs(2),
            control_listener.accept(),
        )
        .await
        .expect("agent did not reconnect")
        .unwrap();

        let request: Option<ControlRequest> = read_frame(&mut control).await.unwrap();
        assert!(matches!(request, Some(ControlRequest::CreateClient { .. })));

        stop_tx.send(true).unwrap();
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn public_port_is_pinned_across_reconnects() {
        let backend_port = echo_backend().await;
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_listener.local_addr().unwrap().to_string();

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut cfg = test_config(control_addr, backend_port);
        cfg.reconnect_delay = Duration::from_millis(20);
        let agent = tokio::spawn(run(cfg, stop_rx));

        // First connection: advertise port 7777, then drop the stream.
        let (mut control, _) = control_listener.accept().await.unwrap();
        let _request: Option<ControlRequest> = read_frame(&mut control).await.unwrap();
        write_frame(
            &mut control,
            &ControlResponse::Event(ClientEvent::Bootstrap {
                public_addr: "127.0.0.1:7777".into(),
                share_public: false,
            }),
        )
        .await
        .unwrap();
        // Give the agent a moment to process the bootstrap before the cut.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(control);

        // Second connection: the agent re-registers asking for 7777.
        let (mut control, _) = control_listener.accept().await.unwrap();
        let request: Option<ControlRequest> = read_frame(&mut control).await.unwrap();
        let Some(ControlRequest::CreateClient { public_port, .. }) = request else {
            panic!("expected CreateClient, got {request:?}");
        };
        assert_eq!(public_port, 7777);

        stop_tx.send(true).unwrap();
        agent.await.unwrap().unwrap();
    }
}
