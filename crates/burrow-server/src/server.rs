//! The rendezvous service: control-plane dispatch and session registry.
//!
//! Every control connection carries one request. `CreateClient` turns the
//! connection into the session's event stream; the stream ending (peer
//! disconnect or server shutdown) is the cancellation signal that tears the
//! session down. Everything else is unary: one response frame and done.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use burrow_core::codec::{read_frame, write_frame};
use burrow_core::error::{BurrowError, BurrowResult};
use burrow_core::messages::{
    ClientEvent, ClientInfo, ControlRequest, ControlResponse, ErrorCode,
};

use crate::listener::ListenerRegistry;
use crate::service::ServiceRegistry;
use crate::session::ClientSession;

/// Deadline for the direct-connect probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry in the session table.
enum SessionEntry {
    /// A normal tunneled session with live listeners.
    Tunnel(Arc<ClientSession>),
    /// A probe-verified direct session: the agent's backend is reachable
    /// as-is, so no listeners exist and pairing never happens.
    Direct {
        display_name: String,
        public_addr: String,
    },
}

/// The rendezvous server. Holds the session and service registries and the
/// host string advertised in every public address.
pub struct RelayServer {
    host: String,
    listeners: Arc<ListenerRegistry>,
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    services: Arc<ServiceRegistry>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(host: String, listeners: Arc<ListenerRegistry>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            host,
            listeners,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            services: ServiceRegistry::new(),
            shutdown,
        })
    }

    /// Serve control connections until [`RelayServer::shutdown`] is called.
    pub async fn run(self: &Arc<Self>, control: TcpListener) -> BurrowResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %control.local_addr()?, "control listener ready");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = control.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "control accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_control(stream, peer).await {
                            debug!(peer = %peer, error = %e, "control connection ended");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop serving: close every session and service. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            if let SessionEntry::Tunnel(session) = entry {
                session.close().await;
            }
        }
        self.services.shutdown_all().await;
        info!("server shut down");
    }

    /// Dispatch one control connection by its first frame.
    async fn handle_control(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> BurrowResult<()> {
        let Some(request) = read_frame::<_, ControlRequest>(&mut stream).await? else {
            return Ok(());
        };
        debug!(peer = %peer, ?request, "control request");

        match request {
            ControlRequest::CreateClient {
                display_name,
                public_port,
                internal_port,
                share_public,
                protocol,
                backend_port,
            } => {
                self.create_client(
                    stream,
                    peer,
                    display_name,
                    public_port,
                    internal_port,
                    share_public,
                    protocol,
                    backend_port,
                )
                .await
            }
            ControlRequest::ListClients => {
                let clients = self.list_clients().await;
                write_frame(&mut stream, &ControlResponse::Clients(clients)).await
            }
            ControlRequest::ListUsers { parent } => {
                let response = match self.sessions.read().await.get(&parent) {
                    Some(SessionEntry::Tunnel(session)) => {
                        ControlResponse::Users(session.users().await)
                    }
                    Some(SessionEntry::Direct { .. }) => ControlResponse::Users(Vec::new()),
                    None => error_response(ErrorCode::NotFound, format!("no session {parent}")),
                };
                write_frame(&mut stream, &response).await
            }
            ControlRequest::StartService { kind, public_port } => {
                let response = match self.services.start(&kind, &self.host, public_port).await {
                    Ok(info) => ControlResponse::ServiceStarted(info),
                    Err(BurrowError::UnknownService(kind)) => {
                        error_response(ErrorCode::NotFound, format!("unknown service kind {kind}"))
                    }
                    Err(e) => error_response(ErrorCode::BindFailed, e.to_string()),
                };
                write_frame(&mut stream, &response).await
            }
            ControlRequest::ListServices => {
                let services = self.services.list().await;
                write_frame(&mut stream, &ControlResponse::Services(services)).await
            }
        }
    }

    /// Serve one `CreateClient` stream from registration to cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn create_client(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        display_name: String,
        public_port: u16,
        internal_port: u16,
        share_public: bool,
        protocol: String,
        backend_port: u16,
    ) -> BurrowResult<()> {
        let id = generate_id();

        // Direct-connect probe: if the agent's backend is reachable from
        // here, skip the tunnel entirely and advertise it as-is.
        if protocol == "tcp" && backend_port > 0 {
            let direct_addr = format!("{}:{}", peer.ip(), backend_port);
            if probe_direct(&direct_addr).await {
                info!(session_id = %id, addr = %direct_addr, "backend directly reachable, no tunnel");
                self.sessions.write().await.insert(
                    id.clone(),
                    SessionEntry::Direct {
                        display_name,
                        public_addr: direct_addr.clone(),
                    },
                );
                let bootstrap = ControlResponse::Event(ClientEvent::Bootstrap {
                    public_addr: direct_addr,
                    share_public: false,
                });
                let result = async {
                    write_frame(&mut stream, &bootstrap).await?;
                    // Park until the agent goes away or we shut down.
                    let mut shutdown = self.shutdown.subscribe();
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = drain_control(&mut stream) => {}
                    }
                    Ok(())
                }
                .await;
                self.sessions.write().await.remove(&id);
                return result;
            }
            debug!(session_id = %id, addr = %direct_addr, "probe failed, tunneling");
        }

        let session = match ClientSession::bind(
            &self.listeners,
            id.clone(),
            display_name.clone(),
            self.host.clone(),
            public_port,
            internal_port,
            share_public,
        ) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(session_id = %id, error = %e, "session bind failed");
                let response = error_response(ErrorCode::BindFailed, e.to_string());
                write_frame(&mut stream, &response).await?;
                return Ok(());
            }
        };

        session.start().await;
        let mut tokens = session
            .take_tokens()
            .await
            .ok_or_else(|| BurrowError::Channel("token stream already taken".into()))?;
        self.sessions
            .write()
            .await
            .insert(id.clone(), SessionEntry::Tunnel(session.clone()));
        info!(
            session_id = %id,
            public = %session.pub_addr(),
            internal = %session.int_addr(),
            "session created"
        );

        let (mut read_half, mut write_half) = stream.into_split();
        let bootstrap = ControlResponse::Event(ClientEvent::Bootstrap {
            public_addr: session.pub_addr(),
            share_public,
        });
        let mut shutdown = self.shutdown.subscribe();

        let stream_result: BurrowResult<()> = async {
            write_frame(&mut write_half, &bootstrap).await?;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    // The agent writes nothing after the request; reading
                    // only ever observes the stream's end.
                    _ = drain_control(&mut read_half) => return Ok(()),
                    token = tokens.recv() => {
                        let Some(token) = token else { return Ok(()) };
                        forward_pairing(&mut write_half, &id, &session, token.to_string(), &display_name).await?;
                    }
                }
            }
        }
        .await;

        debug!(session_id = %id, "control stream ended");
        session.close().await;
        self.sessions.write().await.remove(&id);
        stream_result
    }

    async fn list_clients(&self) -> Vec<ClientInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, entry)| match entry {
                SessionEntry::Tunnel(session) => ClientInfo {
                    id: id.clone(),
                    display_name: session.display_name().to_string(),
                    public_addr: session.pub_addr(),
                    internal_addr: session.int_addr(),
                    share_public: session.share_public(),
                    direct: false,
                },
                SessionEntry::Direct {
                    display_name,
                    public_addr,
                } => ClientInfo {
                    id: id.clone(),
                    display_name: display_name.clone(),
                    public_addr: public_addr.clone(),
                    internal_addr: String::new(),
                    share_public: false,
                    direct: true,
                },
            })
            .collect()
    }
}

/// Send one pairing event.
async fn forward_pairing(
    writer: &mut OwnedWriteHalf,
    id: &str,
    session: &ClientSession,
    token: String,
    display_name: &str,
) -> BurrowResult<()> {
    debug!(session_id = %id, token = %token, "pairing event");
    write_frame(
        writer,
        &ControlResponse::Event(ClientEvent::Pairing {
            session_id: id.to_string(),
            token,
            internal_addr: session.int_addr(),
            public_addr: session.pub_addr(),
            display_name: display_name.to_string(),
        }),
    )
    .await
}

/// Consume (and discard) frames until the control stream ends.
async fn drain_control<R>(reader: &mut R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match read_frame::<_, ControlRequest>(reader).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

/// TCP connect with the probe deadline; true means reachable.
async fn probe_direct(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn error_response(code: ErrorCode, message: String) -> ControlResponse {
    ControlResponse::Error { code, message }
}

/// Opaque id for sessions and services: 16 random bytes, hex-encoded.
pub(crate) fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::messages::UserInfo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_server() -> (Arc<RelayServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = RelayServer::new("127.0.0.1".into(), ListenerRegistry::new());
        let run = server.clone();
        tokio::spawn(async move { run.run(listener).await });
        (server, addr)
    }

    async fn create_client(server_addr: &str, backend_port: u16) -> (TcpStream, ClientEvent) {
        let mut control = TcpStream::connect(server_addr).await.unwrap();
        write_frame(
            &mut control,
            &ControlRequest::CreateClient {
                display_name: "test".into(),
                public_port: 0,
                internal_port: 0,
                share_public: false,
                protocol: "tcp".into(),
                backend_port,
            },
        )
        .await
        .unwrap();
        let bootstrap: Option<ControlResponse> = read_frame(&mut control).await.unwrap();
        match bootstrap {
            Some(ControlResponse::Event(event)) => (control, event),
            other => panic!("expected bootstrap event, got {other:?}"),
        }
    }

    async fn unary(server_addr: &str, request: &ControlRequest) -> ControlResponse {
        let mut control = TcpStream::connect(server_addr).await.unwrap();
        write_frame(&mut control, request).await.unwrap();
        read_frame(&mut control).await.unwrap().expect("response")
    }

    #[tokio::test]
    async fn full_pairing_round_trip() {
        let (server, addr) = start_server().await;
        let (mut control, bootstrap) = create_client(&addr, 0).await;

        let ClientEvent::Bootstrap { public_addr, .. } = bootstrap else {
            panic!("expected bootstrap");
        };
        assert!(!public_addr.ends_with(":0"));

        // A public user shows up; the server streams a pairing event.
        let mut user = TcpStream::connect(&public_addr).await.unwrap();
        let pairing: Option<ControlResponse> = read_frame(&mut control).await.unwrap();
        let Some(ControlResponse::Event(ClientEvent::Pairing {
            token,
            internal_addr,
            ..
        })) = pairing
        else {
            panic!("expected pairing event, got {pairing:?}");
        };
        assert_eq!(token, "0001");

        // Dial back like an agent would.
        let mut internal = TcpStream::connect(&internal_addr).await.unwrap();
        internal.write_all(token.as_bytes()).await.unwrap();

        user.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        internal.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn list_clients_and_users() {
        let (server, addr) = start_server().await;
        let (_control, _bootstrap) = create_client(&addr, 0).await;

        let ControlResponse::Clients(clients) = unary(&addr, &ControlRequest::ListClients).await
        else {
            panic!("expected client list");
        };
        assert_eq!(clients.len(), 1);
        assert!(!clients[0].direct);

        let ControlResponse::Users(users) = unary(
            &addr,
            &ControlRequest::ListUsers {
                parent: clients[0].id.clone(),
            },
        )
        .await
        else {
            panic!("expected user list");
        };
        assert_eq!(users, Vec::<UserInfo>::new());

        let response = unary(
            &addr,
            &ControlRequest::ListUsers {
                parent: "missing".into(),
            },
        )
        .await;
        assert!(matches!(
            response,
            ControlResponse::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_removes_session_and_closes_pairs() {
        let (server, addr) = start_server().await;
        let (mut control, bootstrap) = create_client(&addr, 0).await;
        let ClientEvent::Bootstrap { public_addr, .. } = bootstrap else {
            panic!("expected bootstrap");
        };

        let mut user = TcpStream::connect(&public_addr).await.unwrap();
        let pairing: Option<ControlResponse> = read_frame(&mut control).await.unwrap();
        let Some(ControlResponse::Event(ClientEvent::Pairing {
            token,
            internal_addr,
            ..
        })) = pairing
        else {
            panic!("expected pairing event");
        };
        let mut internal = TcpStream::connect(&internal_addr).await.unwrap();
        internal.write_all(token.as_bytes()).await.unwrap();

        // Cancel the control stream; the paired sockets must close promptly.
        drop(control);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), user.read(&mut buf))
            .await
            .expect("pair survived cancellation")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // And the session disappears from the registry.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let ControlResponse::Clients(clients) =
                    unary(&addr, &ControlRequest::ListClients).await
                else {
                    panic!("expected client list");
                };
                if clients.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session not removed after cancellation");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn direct_probe_skips_listeners() {
        let (server, addr) = start_server().await;

        // A listener on the "agent's" host standing in for its backend.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if backend.accept().await.is_err() {
                    break;
                }
            }
        });

        let (_control, bootstrap) = create_client(&addr, backend_port).await;
        let ClientEvent::Bootstrap { public_addr, .. } = bootstrap else {
            panic!("expected bootstrap");
        };
        assert_eq!(public_addr, format!("127.0.0.1:{backend_port}"));

        let ControlResponse::Clients(clients) = unary(&addr, &ControlRequest::ListClients).await
        else {
            panic!("expected client list");
        };
        assert_eq!(clients.len(), 1);
        assert!(clients[0].direct);
        assert!(clients[0].internal_addr.is_empty());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn service_lifecycle_over_control_plane() {
        let (server, addr) = start_server().await;

        let response = unary(
            &addr,
            &ControlRequest::StartService {
                kind: "l7forwarder".into(),
                public_port: 0,
            },
        )
        .await;
        let ControlResponse::ServiceStarted(info) = response else {
            panic!("expected service info, got {response:?}");
        };
        assert_eq!(info.kind, "l7forwarder");

        let ControlResponse::Services(services) = unary(&addr, &ControlRequest::ListServices).await
        else {
            panic!("expected service list");
        };
        assert_eq!(services.len(), 1);

        let response = unary(
            &addr,
            &ControlRequest::StartService {
                kind: "nope".into(),
                public_port: 0,
            },
        )
        .await;
        assert!(matches!(
            response,
            ControlResponse::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));

        server.shutdown().await;
    }
}
