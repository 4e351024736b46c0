//! Control-plane messages exchanged between the agent/CLI and the server.
//!
//! Every control connection carries framed CBOR (see [`crate::codec`]).
//! The first frame is a [`ControlRequest`]; the server answers with one
//! [`ControlResponse`], except for `CreateClient` where the connection
//! stays open and streams [`ClientEvent`]s until either side goes away.

use serde::{Deserialize, Serialize};

/// A request opening a control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Register a client session. The connection becomes the session's
    /// event stream; closing it tears the session down.
    CreateClient {
        display_name: String,
        /// Desired public port, 0 = let the OS pick.
        public_port: u16,
        /// Desired internal (dial-back) port, 0 = let the OS pick.
        internal_port: u16,
        /// Share the public port with other sessions that also opt in.
        share_public: bool,
        /// Backend protocol; only "tcp" is recognized today.
        protocol: String,
        /// Backend port advertised for the direct-connect probe, 0 = none.
        backend_port: u16,
    },
    /// List live client sessions.
    ListClients,
    /// List connected public users of one session.
    ListUsers { parent: String },
    /// Spawn a server-side internal service of the given kind.
    StartService {
        kind: String,
        /// Public port for the service, 0 = let the OS pick.
        public_port: u16,
    },
    /// List running internal services.
    ListServices,
}

/// A response frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Event(ClientEvent),
    Clients(Vec<ClientInfo>),
    Users(Vec<UserInfo>),
    ServiceStarted(ServiceInfo),
    Services(Vec<ServiceInfo>),
    Error { code: ErrorCode, message: String },
}

/// Events streamed to a client agent over its `CreateClient` connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// First event on every stream: where the session is reachable.
    /// Carries no token and no internal address.
    Bootstrap {
        public_addr: String,
        share_public: bool,
    },
    /// A public user connected; dial back and present the token.
    Pairing {
        session_id: String,
        token: String,
        internal_addr: String,
        public_addr: String,
        display_name: String,
    },
}

/// Error classification carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    BindFailed,
    Internal,
}

/// A live client session, as reported by `ListClients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub public_addr: String,
    /// Empty for direct (probe-verified) sessions, which have no listeners.
    pub internal_addr: String,
    pub share_public: bool,
    /// True when the session was established via the direct-connect probe.
    pub direct: bool,
}

/// One connected (or pending) public user of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_addr: String,
    /// Bytes per second flowing toward the backend, 5-second average.
    pub rate_in: f64,
    /// Bytes per second flowing toward the public user, 5-second average.
    pub rate_out: f64,
}

/// A running internal service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub kind: String,
    pub addr: String,
}
