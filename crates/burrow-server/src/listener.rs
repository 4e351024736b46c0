//! Listener plumbing: owned accept loops and the shared-listener registry.
//!
//! Sessions that opt into sharing a public port all acquire the same
//! underlying listener through [`ListenerRegistry`]; reference counting
//! (rather than SO_REUSEPORT) keeps the semantics identical across
//! platforms and routes each accepted socket to exactly one subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use burrow_core::error::{BurrowError, BurrowResult};

/// Queue depth per subscriber; a subscriber that falls this far behind is
/// skipped for the next accepted socket.
const SUBSCRIBER_BACKLOG: usize = 16;

type SubscriberList = Arc<Mutex<Vec<(u64, mpsc::Sender<TcpStream>)>>>;

/// A stream of accepted sockets from either an exclusively owned listener
/// or a shared one. Dropping (or closing) the handle stops the owned
/// accept loop or releases the shared reference.
pub struct Acceptor {
    port: u16,
    conns: mpsc::Receiver<TcpStream>,
    teardown: Teardown,
}

enum Teardown {
    /// Sender half of the accept loop's cancel channel; dropping it ends
    /// the loop and closes the listener.
    Owned(mpsc::Sender<()>),
    Shared {
        registry: Arc<ListenerRegistry>,
        key: String,
        subscriber: u64,
    },
    Done,
}

impl Acceptor {
    /// Bind an exclusive listener. Must run inside a tokio runtime.
    pub fn bind(addr: &str) -> BurrowResult<Self> {
        let (listener, port) = bind_nonblocking(addr)?;
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let (conn_tx, conn_rx) = mpsc::channel(SUBSCRIBER_BACKLOG);

        tokio::spawn(accept_loop(listener, cancel_rx, conn_tx));

        Ok(Self {
            port,
            conns: conn_rx,
            teardown: Teardown::Owned(cancel_tx),
        })
    }

    /// The port actually bound (meaningful when the caller asked for 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next accepted socket; `None` once the listener is gone.
    pub async fn recv(&mut self) -> Option<TcpStream> {
        self.conns.recv().await
    }

    /// Stop accepting. Idempotent; also invoked on drop.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.teardown, Teardown::Done) {
            Teardown::Owned(cancel) => drop(cancel),
            Teardown::Shared {
                registry,
                key,
                subscriber,
            } => registry.release(&key, subscriber),
            Teardown::Done => {}
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept loop for an exclusive listener. Ends when the cancel sender is
/// dropped or the socket channel has no receiver left.
async fn accept_loop(
    listener: TcpListener,
    mut cancel: mpsc::Receiver<()>,
    conns: mpsc::Sender<TcpStream>,
) {
    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    if conns.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Process-wide table of shared listeners, keyed by `network/address`.
///
/// Constructed once and passed down explicitly; one mutex covers lookup,
/// insert, refcount changes, and the close decision. The on-last-release
/// hook runs outside the lock.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<HashMap<String, SharedEntry>>,
}

struct SharedEntry {
    refcount: usize,
    next_subscriber: u64,
    port: u16,
    subscribers: SubscriberList,
    /// Dropping this ends the fan-out loop and closes the listener.
    cancel: mpsc::Sender<()>,
    on_last_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire a shared listener for `addr` (which must carry a concrete
    /// non-zero port; port 0 callers use [`Acceptor::bind`] instead). The
    /// first acquirer binds and provides the on-last-release hook; later
    /// acquirers join as additional subscribers.
    pub fn acquire(
        self: &Arc<Self>,
        addr: &str,
        on_last_release: impl FnOnce() + Send + 'static,
    ) -> BurrowResult<Acceptor> {
        let key = format!("tcp/{addr}");
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            let subscriber = entry.next_subscriber;
            entry.next_subscriber += 1;
            let (conn_tx, conn_rx) = mpsc::channel(SUBSCRIBER_BACKLOG);
            entry
                .subscribers
                .lock()
                .unwrap()
                .push((subscriber, conn_tx));
            debug!(addr, refcount = entry.refcount, "joined shared listener");
            return Ok(Acceptor {
                port: entry.port,
                conns: conn_rx,
                teardown: Teardown::Shared {
                    registry: self.clone(),
                    key,
                    subscriber,
                },
            });
        }

        let (listener, port) = bind_nonblocking(addr)?;
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let (conn_tx, conn_rx) = mpsc::channel(SUBSCRIBER_BACKLOG);
        let subscribers: SubscriberList = Arc::new(Mutex::new(vec![(0, conn_tx)]));

        tokio::spawn(fan_out_loop(listener, cancel_rx, subscribers.clone()));

        entries.insert(
            key.clone(),
            SharedEntry {
                refcount: 1,
                next_subscriber: 1,
                port,
                subscribers,
                cancel: cancel_tx,
                on_last_release: Some(Box::new(on_last_release)),
            },
        );
        debug!(addr, "shared listener bound");

        Ok(Acceptor {
            port,
            conns: conn_rx,
            teardown: Teardown::Shared {
                registry: self.clone(),
                key,
                subscriber: 0,
            },
        })
    }

    /// Drop one reference. The last release closes the listener, removes
    /// the entry, and then runs the hook.
    fn release(&self, key: &str, subscriber: u64) {
        let hook = {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry
                .subscribers
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != subscriber);
            entry.refcount -= 1;
            if entry.refcount > 0 {
                debug!(key, refcount = entry.refcount, "shared listener released");
                None
            } else {
                let entry = entries.remove(key).unwrap();
                drop(entry.cancel);
                debug!(key, "shared listener closed");
                entry.on_last_release
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Whether an entry exists for `addr`.
    #[cfg(test)]
    pub fn contains(&self, addr: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&format!("tcp/{addr}"))
    }
}

/// Accept loop for a shared listener: each socket goes to exactly one
/// subscriber, rotating over whoever is currently subscribed. A subscriber
/// with a full or closed queue is skipped; no fairness is promised.
async fn fan_out_loop(
    listener: TcpListener,
    mut cancel: mpsc::Receiver<()>,
    subscribers: SubscriberList,
) {
    let mut next = 0usize;
    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let subs = subscribers.lock().unwrap().clone();
                    if subs.is_empty() {
                        debug!(peer = %peer, "no subscribers, dropping connection");
                        continue;
                    }
                    let mut stream = stream;
                    let mut delivered = false;
                    for offset in 0..subs.len() {
                        let slot = (next + offset) % subs.len();
                        match subs[slot].1.try_send(stream) {
                            Ok(()) => {
                                next = (slot + 1) % subs.len();
                                delivered = true;
                                break;
                            }
                            Err(mpsc::error::TrySendError::Full(s))
                            | Err(mpsc::error::TrySendError::Closed(s)) => stream = s,
                        }
                    }
                    if !delivered {
                        warn!(peer = %peer, "all subscribers stalled, dropping connection");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed on shared listener");
                }
            }
        }
    }
}

/// Bind synchronously and hand the socket to tokio. Keeping the bind
/// synchronous lets [`ListenerRegistry::acquire`] hold its mutex across
/// the whole lookup-or-bind step.
fn bind_nonblocking(addr: &str) -> BurrowResult<(TcpListener, u16)> {
    let std_listener = std::net::TcpListener::bind(addr).map_err(|source| BurrowError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    std_listener
        .set_nonblocking(true)
        .map_err(BurrowError::Io)?;
    let listener = TcpListener::from_std(std_listener).map_err(BurrowError::Io)?;
    let port = listener.local_addr().map_err(BurrowError::Io)?.port();
    Ok((listener, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn owned_acceptor_hands_out_connections() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0").unwrap();
        assert_ne!(acceptor.port(), 0);

        let addr = format!("127.0.0.1:{}", acceptor.port());
        let _client = TcpStream::connect(&addr).await.unwrap();
        assert!(acceptor.recv().await.is_some());
    }

    #[tokio::test]
    async fn refcount_governs_listener_lifetime() {
        let registry = ListenerRegistry::new();
        let released = Arc::new(AtomicUsize::new(0));
        let addr = format!("127.0.0.1:{}", free_port());

        let hook = released.clone();
        let mut a = registry
            .acquire(&addr, move || {
                hook.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let hook = released.clone();
        let mut b = registry
            .acquire(&addr, move || {
                hook.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(a.port(), b.port());
        assert!(registry.contains(&addr));

        a.close();
        assert!(registry.contains(&addr));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        b.close();
        assert!(!registry.contains(&addr));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // The port is free again.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::net::TcpListener::bind(&addr).unwrap();
    }

    #[tokio::test]
    async fn shared_sockets_reach_every_subscriber() {
        let registry = ListenerRegistry::new();
        let addr = format!("127.0.0.1:{}", free_port());

        let mut a = registry.acquire(&addr, || {}).unwrap();
        let mut b = registry.acquire(&addr, || {}).unwrap();

        for _ in 0..4 {
            let _c = TcpStream::connect(&addr).await.unwrap();
        }

        // Round-robin: four sockets, two subscribers, two each.
        let mut got_a = 0;
        let mut got_b = 0;
        for _ in 0..2 {
            assert!(a.recv().await.is_some());
            got_a += 1;
            assert!(b.recv().await.is_some());
            got_b += 1;
        }
        assert_eq!((got_a, got_b), (2, 2));
    }

    #[tokio::test]
    async fn sole_subscriber_receives_everything() {
        let registry = ListenerRegistry::new();
        let addr = format!("127.0.0.1:{}", free_port());
        let mut only = registry.acquire(&addr, || {}).unwrap();

        for _ in 0..3 {
            let _c = TcpStream::connect(&addr).await.unwrap();
        }
        for _ in 0..3 {
            assert!(only.recv().await.is_some());
        }
    }
}
