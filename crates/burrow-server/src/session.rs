//! Per-client session state: two listeners, token issue, and pairing.
//!
//! One coordinator task serializes everything that touches the token map:
//! public accepts allocate tokens, internal accepts claim them, finished
//! pairs report back over a completion channel and are evicted. External
//! readers (the list-users RPC) see the map through a read lock; the
//! coordinator is its only writer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use burrow_core::error::BurrowResult;
use burrow_core::messages::UserInfo;
use burrow_core::pair::{ConnPair, PairHandle};
use burrow_core::token::{Token, TokenCounter, TOKEN_LEN};

use crate::listener::{Acceptor, ListenerRegistry};

/// One public connection, keyed by its token.
enum PairSlot {
    /// Public socket accepted, waiting for the agent to dial back.
    Pending {
        stream: TcpStream,
        user_addr: String,
    },
    /// Spliced and flowing.
    Running {
        handle: PairHandle,
        user_addr: String,
    },
}

type PairMap = Arc<RwLock<HashMap<Token, PairSlot>>>;

/// A live client session. Owns its internal listener exclusively and its
/// public listener either exclusively or as one reference on a shared one.
pub struct ClientSession {
    id: String,
    display_name: String,
    host: String,
    share_public: bool,
    pub_port: u16,
    int_port: u16,
    pairs: PairMap,
    done: watch::Sender<bool>,
    /// Listeners and channel ends handed to the coordinator at `start`.
    parts: Mutex<Option<CoordinatorParts>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    notify: Mutex<Option<mpsc::Receiver<Token>>>,
}

struct CoordinatorParts {
    pub_acceptor: Acceptor,
    int_acceptor: Acceptor,
    notify_tx: mpsc::Sender<Token>,
    done_rx: watch::Receiver<bool>,
}

impl ClientSession {
    /// Bind both listeners. The internal listener is never shared; the
    /// public one goes through the registry when `share_public` is set and
    /// a concrete port was requested. OS-picked ports are retained.
    pub fn bind(
        registry: &Arc<ListenerRegistry>,
        id: String,
        display_name: String,
        host: String,
        pub_port: u16,
        int_port: u16,
        share_public: bool,
    ) -> BurrowResult<Self> {
        let int_acceptor = Acceptor::bind(&format!("{host}:{int_port}"))?;

        let pub_addr = format!("{host}:{pub_port}");
        let pub_acceptor = if share_public && pub_port != 0 {
            let released_addr = pub_addr.clone();
            registry.acquire(&pub_addr, move || {
                debug!(addr = %released_addr, "shared public port fully released");
            })?
        } else {
            Acceptor::bind(&pub_addr)?
        };

        let (notify_tx, notify_rx) = mpsc::channel(16);
        let (done, done_rx) = watch::channel(false);

        Ok(Self {
            id,
            display_name,
            host,
            share_public,
            pub_port: pub_acceptor.port(),
            int_port: int_acceptor.port(),
            pairs: Arc::new(RwLock::new(HashMap::new())),
            done,
            parts: Mutex::new(Some(CoordinatorParts {
                pub_acceptor,
                int_acceptor,
                notify_tx,
                done_rx,
            })),
            coordinator: Mutex::new(None),
            notify: Mutex::new(Some(notify_rx)),
        })
    }

    /// Launch the pairing coordinator. Idempotent for safety, but callers
    /// start a session exactly once.
    pub async fn start(&self) {
        let Some(parts) = self.parts.lock().await.take() else {
            return;
        };
        let handle = tokio::spawn(coordinate(
            self.id.clone(),
            parts,
            self.pairs.clone(),
        ));
        *self.coordinator.lock().await = Some(handle);
    }

    /// Take the stream of newly issued tokens. Yields each token once, in
    /// issue order; ends when the session closes.
    pub async fn take_tokens(&self) -> Option<mpsc::Receiver<Token>> {
        self.notify.lock().await.take()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn share_public(&self) -> bool {
        self.share_public
    }

    /// Advertised public address, `host:port`.
    pub fn pub_addr(&self) -> String {
        format!("{}:{}", self.host, self.pub_port)
    }

    /// Advertised internal (dial-back) address, `host:port`.
    pub fn int_addr(&self) -> String {
        format!("{}:{}", self.host, self.int_port)
    }

    /// Snapshot of connected and pending public users with their 5-second
    /// throughput averages.
    pub async fn users(&self) -> Vec<UserInfo> {
        let pairs = self.pairs.read().await;
        pairs
            .values()
            .map(|slot| match slot {
                PairSlot::Pending { user_addr, .. } => UserInfo {
                    user_addr: user_addr.clone(),
                    rate_in: 0.0,
                    rate_out: 0.0,
                },
                PairSlot::Running { handle, user_addr } => {
                    let (rate_in, rate_out) = handle.rates();
                    UserInfo {
                        user_addr: user_addr.clone(),
                        rate_in,
                        rate_out,
                    }
                }
            })
            .collect()
    }

    /// Close the session: stop both listeners, close every pair, and wait
    /// until no session task remains. Idempotent.
    pub async fn close(&self) {
        let _ = self.done.send(true);
        // Holding the lock across the await makes concurrent closers wait
        // for the teardown rather than return early.
        let mut coordinator = self.coordinator.lock().await;
        if let Some(handle) = coordinator.take() {
            let _ = handle.await;
        }
        drop(coordinator);
        // Never started: binding side effects still need teardown.
        drop(self.parts.lock().await.take());
        info!(session_id = %self.id, "session closed");
    }
}

/// The pairing loop. Sole writer of the pair map.
async fn coordinate(session_id: String, mut parts: CoordinatorParts, pairs: PairMap) {
    let mut counter = TokenCounter::new();
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Token>();

    loop {
        tokio::select! {
            _ = parts.done_rx.changed() => break,
            conn = parts.pub_acceptor.recv() => {
                let Some(stream) = conn else { break };
                let token = counter.next();
                let user_addr = peer_label(&stream);
                debug!(session_id = %session_id, token = %token, user = %user_addr, "public user connected");
                pairs.write().await.insert(token, PairSlot::Pending { stream, user_addr });
                if parts.notify_tx.send(token).await.is_err() {
                    // Control stream is gone; the session is on its way down.
                    break;
                }
            }
            conn = parts.int_acceptor.recv() => {
                let Some(stream) = conn else { break };
                match_internal(&session_id, stream, &pairs, &completion_tx).await;
            }
            completed = completion_rx.recv() => {
                if let Some(token) = completed {
                    if pairs.write().await.remove(&token).is_some() {
                        debug!(session_id = %session_id, token = %token, "public user disconnected");
                    }
                }
            }
        }
    }

    // Teardown: stop accepting, drop pending sockets, close running pairs
    // and wait for each to finish.
    parts.pub_acceptor.close();
    parts.int_acceptor.close();

    let slots: Vec<PairSlot> = {
        let mut map = pairs.write().await;
        map.drain().map(|(_, slot)| slot).collect()
    };
    let mut running = Vec::new();
    for slot in slots {
        match slot {
            PairSlot::Pending { stream, .. } => drop(stream),
            PairSlot::Running { handle, .. } => {
                handle.close();
                running.push(handle);
            }
        }
    }
    for handle in running {
        handle.wait_closed().await;
    }
    debug!(session_id = %session_id, "coordinator exited");
}

/// Handle an internal dial-back: read the 4-byte token and splice it onto
/// the pending public socket. An unknown token or a short read is a
/// protocol violation that costs only this socket.
async fn match_internal(
    session_id: &str,
    mut stream: TcpStream,
    pairs: &PairMap,
    completion_tx: &mpsc::UnboundedSender<Token>,
) {
    let mut buf = [0u8; TOKEN_LEN];
    if let Err(e) = stream.read_exact(&mut buf).await {
        warn!(session_id = %session_id, error = %e, "internal dial sent short token");
        return;
    }
    let token = match Token::from_wire(&buf) {
        Ok(token) => token,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "internal dial sent malformed token");
            return;
        }
    };

    let mut map = pairs.write().await;
    let Some(slot) = map.remove(&token) else {
        drop(map);
        warn!(session_id = %session_id, token = %token, "internal dial for unknown token");
        return;
    };
    let PairSlot::Pending {
        stream: public,
        user_addr,
    } = slot
    else {
        // Token already paired; reinserting keeps the live pair intact.
        map.insert(token, slot);
        drop(map);
        warn!(session_id = %session_id, token = %token, "internal dial for already-paired token");
        return;
    };

    let completion = completion_tx.clone();
    let handle = ConnPair::new(public, stream)
        .label(user_addr.clone())
        .on_close(move || {
            let _ = completion.send(token);
        })
        .spawn();
    map.insert(token, PairSlot::Running { handle, user_addr });
    debug!(session_id = %session_id, token = %token, "pair spliced");
}

fn peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn start_session(
        registry: &Arc<ListenerRegistry>,
        id: &str,
        pub_port: u16,
        share: bool,
    ) -> (Arc<ClientSession>, mpsc::Receiver<Token>) {
        let session = ClientSession::bind(
            registry,
            id.into(),
            "test".into(),
            "127.0.0.1".into(),
            pub_port,
            0,
            share,
        )
        .unwrap();
        let session = Arc::new(session);
        session.start().await;
        let tokens = session.take_tokens().await.unwrap();
        (session, tokens)
    }

    async fn test_session(share: bool) -> (Arc<ClientSession>, mpsc::Receiver<Token>) {
        start_session(&ListenerRegistry::new(), "s1", 0, share).await
    }

    async fn dial_back(session: &ClientSession, token: Token) -> TcpStream {
        let mut internal = TcpStream::connect(session.int_addr()).await.unwrap();
        internal.write_all(&token.wire()).await.unwrap();
        internal
    }

    #[tokio::test]
    async fn auto_ports_are_concrete() {
        let (session, _tokens) = test_session(false).await;
        assert!(!session.pub_addr().ends_with(":0"));
        assert!(!session.int_addr().ends_with(":0"));
        session.close().await;
    }

    #[tokio::test]
    async fn pairs_and_relays_bytes() {
        let (session, mut tokens) = test_session(false).await;

        let mut user = TcpStream::connect(session.pub_addr()).await.unwrap();
        let token = tokens.recv().await.unwrap();
        assert_eq!(token.to_string(), "0001");

        let mut internal = dial_back(&session, token).await;

        user.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        internal.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");

        internal.write_all(b"and back").await.unwrap();
        let mut buf = [0u8; 8];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");

        // Dropping both ends terminates the pair and evicts the token.
        drop(user);
        drop(internal);
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if session.users().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pair entry not removed");

        session.close().await;
    }

    #[tokio::test]
    async fn tokens_issue_in_order() {
        let (session, mut tokens) = test_session(false).await;

        let _u1 = TcpStream::connect(session.pub_addr()).await.unwrap();
        let _u2 = TcpStream::connect(session.pub_addr()).await.unwrap();

        let t1 = tokens.recv().await.unwrap();
        let t2 = tokens.recv().await.unwrap();
        assert_eq!(t1.to_string(), "0001");
        assert_eq!(t2.to_string(), "0002");

        session.close().await;
    }

    #[tokio::test]
    async fn unknown_token_closes_only_that_socket() {
        let (session, mut tokens) = test_session(false).await;

        let mut rogue = TcpStream::connect(session.int_addr()).await.unwrap();
        rogue.write_all(b"9999").await.unwrap();

        // The rogue socket is dropped by the server.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(3), rogue.read(&mut buf))
            .await
            .expect("rogue socket not closed")
            .unwrap();
        assert_eq!(n, 0);

        // The session still pairs normally afterwards.
        let mut user = TcpStream::connect(session.pub_addr()).await.unwrap();
        let token = tokens.recv().await.unwrap();
        let mut internal = dial_back(&session, token).await;
        user.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        internal.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        session.close().await;
    }

    #[tokio::test]
    async fn two_sessions_share_one_public_port() {
        let registry = ListenerRegistry::new();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = format!("127.0.0.1:{port}");

        let (first, mut first_tokens) = start_session(&registry, "s1", port, true).await;
        let (second, mut second_tokens) = start_session(&registry, "s2", port, true).await;
        assert!(registry.contains(&addr));

        // Alternate users land on alternate sessions.
        let _u1 = TcpStream::connect(&addr).await.unwrap();
        let _u2 = TcpStream::connect(&addr).await.unwrap();
        let t1 = first_tokens.recv().await.unwrap();
        let t2 = second_tokens.recv().await.unwrap();
        assert_eq!(t1.to_string(), "0001");
        assert_eq!(t2.to_string(), "0001");

        // Releasing one session leaves the port bound for the other.
        first.close().await;
        assert!(registry.contains(&addr));
        let _u3 = TcpStream::connect(&addr).await.unwrap();
        assert!(second_tokens.recv().await.is_some());

        second.close().await;
        assert!(!registry.contains(&addr));
    }

    #[tokio::test]
    async fn close_terminates_live_pairs_and_is_idempotent() {
        let (session, mut tokens) = test_session(false).await;

        let mut user = TcpStream::connect(session.pub_addr()).await.unwrap();
        let token = tokens.recv().await.unwrap();
        let _internal = dial_back(&session, token).await;

        session.close().await;
        session.close().await;

        // The public user observes EOF once the pair is torn down.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), user.read(&mut buf))
            .await
            .expect("pair not closed after session close")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(session.users().await.is_empty());
    }
}
