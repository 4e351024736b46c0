//! Server-side internal services.
//!
//! The one recognized kind is `l7forwarder`: an HTTP forward proxy bound on
//! a public port, useful in front of shared-port sessions. It speaks just
//! enough HTTP to take a `CONNECT` (or an absolute-form request), reach the
//! origin, and hand both sockets to the splice engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use burrow_core::error::{BurrowError, BurrowResult};
use burrow_core::messages::ServiceInfo;
use burrow_core::pair::ConnPair;

/// Grace period granted to each service on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Cap on a proxied request head.
const MAX_HEAD_LEN: usize = 8 * 1024;

pub const FORWARDER_KIND: &str = "l7forwarder";

struct ServiceEntry {
    info: ServiceInfo,
    /// Dropping this stops the service's accept loop.
    cancel: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Registry of running internal services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a service of `kind` on `host:port` (port 0 = OS pick) and
    /// return its id and listening address.
    pub async fn start(&self, kind: &str, host: &str, port: u16) -> BurrowResult<ServiceInfo> {
        if kind != FORWARDER_KIND {
            return Err(BurrowError::UnknownService(kind.to_string()));
        }

        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BurrowError::Bind { addr, source })?;
        let bound = format!("{host}:{}", listener.local_addr()?.port());
        let id = crate::server::generate_id();

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(forwarder_loop(listener, cancel_rx));

        let info = ServiceInfo {
            id: id.clone(),
            kind: kind.to_string(),
            addr: bound.clone(),
        };
        info!(service_id = %id, addr = %bound, "forwarder service started");
        self.services.write().await.insert(
            id,
            ServiceEntry {
                info: info.clone(),
                cancel: cancel_tx,
                task,
            },
        );
        Ok(info)
    }

    /// List running services.
    pub async fn list(&self) -> Vec<ServiceInfo> {
        self.services
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Stop every service, granting each the shutdown grace period.
    pub async fn shutdown_all(&self) {
        let entries: Vec<ServiceEntry> = {
            let mut services = self.services.write().await;
            services.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            drop(entry.cancel);
            if tokio::time::timeout(SHUTDOWN_GRACE, entry.task)
                .await
                .is_err()
            {
                warn!(service_id = %entry.info.id, "service did not stop within grace period");
            } else {
                info!(service_id = %entry.info.id, "service stopped");
            }
        }
    }
}

/// Accept loop for the forwarder; one task per proxied connection.
async fn forwarder_loop(listener: TcpListener, mut cancel: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "forwarder connection accepted");
                    tokio::spawn(async move {
                        if let Err(e) = proxy_connection(stream).await {
                            debug!(peer = %peer, error = %e, "forwarder connection ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "forwarder accept failed"),
            }
        }
    }
}

/// Serve one proxied client: parse the request head, dial the origin, and
/// splice. Tunnels (`CONNECT`) get a 200 first; absolute-form requests are
/// rewritten to origin-form and replayed.
async fn proxy_connection(mut client: TcpStream) -> BurrowResult<()> {
    let (head, leftover) = read_head(&mut client).await?;
    let request = ProxyRequest::parse(&head)?;

    let mut origin = match TcpStream::connect(&request.origin).await {
        Ok(origin) => origin,
        Err(e) => {
            let _ = client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return Err(e.into());
        }
    };

    match request.replay {
        None => {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
            // Bytes the client pipelined after the CONNECT head.
            origin.write_all(&leftover).await?;
        }
        Some(rewritten) => {
            origin.write_all(rewritten.as_bytes()).await?;
            origin.write_all(&leftover).await?;
        }
    }

    let handle = ConnPair::new(client, origin)
        .label(request.origin.clone())
        .spawn();
    handle.wait_closed().await;
    Ok(())
}

/// A parsed proxy request: where to connect, and what (if anything) to
/// replay to the origin before splicing.
#[derive(Debug, PartialEq)]
struct ProxyRequest {
    origin: String,
    /// `None` for CONNECT tunnels; rewritten head for absolute-form.
    replay: Option<String>,
}

impl ProxyRequest {
    fn parse(head: &str) -> BurrowResult<Self> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, target, version) = (
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        );

        if method == "CONNECT" {
            if !target.contains(':') {
                return Err(BurrowError::Protocol(format!(
                    "CONNECT target has no port: {target}"
                )));
            }
            return Ok(Self {
                origin: target.to_string(),
                replay: None,
            });
        }

        // Absolute-form: METHOD http://host[:port]/path HTTP/1.x
        let Some(rest) = target.strip_prefix("http://") else {
            return Err(BurrowError::Protocol(format!(
                "unsupported proxy target: {target}"
            )));
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let origin = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        };

        let mut rewritten = format!("{method} {path} {version}\r\n");
        for line in lines {
            rewritten.push_str(line);
            rewritten.push_str("\r\n");
        }
        Ok(Self {
            origin,
            replay: Some(rewritten),
        })
    }
}

/// Read up to and including the blank line ending the request head.
/// Returns the head text and any bytes read past it.
async fn read_head(stream: &mut TcpStream) -> BurrowResult<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(BurrowError::Protocol("connection closed mid-head".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            let head = String::from_utf8(buf)
                .map_err(|_| BurrowError::Protocol("request head is not UTF-8".into()))?;
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(BurrowError::Protocol("request head too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}
