//! The splice engine: full-duplex copy between two connected byte streams.
//!
//! A [`ConnPair`] runs one task per direction plus a throughput sampler and
//! a joiner. The first direction to terminate (EOF or error) stops the pair:
//! the joiner signals the surviving direction, waits for every task, and
//! then fires the on-close callback exactly once, with both streams already
//! closed. Per-pair errors never propagate anywhere else.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::pool::copy_buffers;

/// Throughput sampling window.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// How long the joiner waits for the surviving direction to notice the stop
/// signal before tearing it down by force.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Per-direction throughput gauges, bytes per second averaged over the last
/// full sampling window. Readable while the pair is running.
#[derive(Debug, Default)]
pub struct PairRates {
    /// src → dst direction.
    forward: AtomicU64,
    /// dst → src direction.
    backward: AtomicU64,
}

impl PairRates {
    fn store(&self, forward: f64, backward: f64) {
        self.forward.store(forward.to_bits(), Ordering::Relaxed);
        self.backward.store(backward.to_bits(), Ordering::Relaxed);
    }

    /// `(src→dst, dst→src)` in bytes per second.
    pub fn snapshot(&self) -> (f64, f64) {
        (
            f64::from_bits(self.forward.load(Ordering::Relaxed)),
            f64::from_bits(self.backward.load(Ordering::Relaxed)),
        )
    }
}

/// Two connected streams about to be spliced into one byte pipe.
pub struct ConnPair<S, D> {
    src: S,
    dst: D,
    label: String,
    on_close: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl<S, D> ConnPair<S, D>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(src: S, dst: D) -> Self {
        Self {
            src,
            dst,
            label: String::new(),
            on_close: None,
        }
    }

    /// Attach a label used in log lines (typically the peer address).
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Register a callback invoked exactly once after both streams are
    /// closed and every pair task has exited.
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Start copying. The returned handle observes and stops the pair; the
    /// pair itself keeps running when the handle is dropped.
    pub fn spawn(self) -> PairHandle {
        let (src_r, src_w) = tokio::io::split(self.src);
        let (dst_r, dst_w) = tokio::io::split(self.dst);

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (done_tx, done_rx) = watch::channel(false);

        let rates = Arc::new(PairRates::default());
        let (fwd_meter_tx, fwd_meter_rx) = mpsc::unbounded_channel();
        let (bwd_meter_tx, bwd_meter_rx) = mpsc::unbounded_channel();

        // Clean-exit flags: [src→dst, dst→src]. A direction that errors
        // consults the other's flag to decide whether its own error is just
        // the echo of an orderly close.
        let clean = Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);

        let mut directions = JoinSet::new();
        directions.spawn(copy_direction(
            src_r,
            dst_w,
            fwd_meter_tx,
            stop_rx.clone(),
            clean.clone(),
            0,
            self.label.clone(),
        ));
        directions.spawn(copy_direction(
            dst_r,
            src_w,
            bwd_meter_tx,
            stop_rx,
            clean.clone(),
            1,
            self.label.clone(),
        ));

        let sampler = tokio::spawn(sample_rates(fwd_meter_rx, bwd_meter_rx, rates.clone()));

        let joiner_stop = stop_tx.clone();
        let mut external_stop = joiner_stop.subscribe();
        let mut on_close = self.on_close;
        tokio::spawn(async move {
            // The pair ends when a direction finishes or close() is called.
            tokio::select! {
                _ = directions.join_next() => {
                    let _ = joiner_stop.send(true);
                }
                _ = external_stop.changed() => {}
            }

            // Drain the remaining directions, by force past the grace
            // period (a direction can sit in a blocked write).
            loop {
                match tokio::time::timeout(DRAIN_GRACE, directions.join_next()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(_) => directions.abort_all(),
                }
            }

            // Both streams are closed once every half is dropped; the
            // sampler exits when the meter senders go with them.
            let _ = sampler.await;

            if let Some(f) = on_close.take() {
                f();
            }
            let _ = done_tx.send(true);
        });

        PairHandle {
            stop: stop_tx,
            done: done_rx,
            rates,
        }
    }
}

/// Observer/controller for a running pair.
#[derive(Debug, Clone)]
pub struct PairHandle {
    stop: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
    rates: Arc<PairRates>,
}

impl PairHandle {
    /// Stop the pair. Idempotent; also safe after the pair ended on its own.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    /// Current `(src→dst, dst→src)` throughput in bytes per second.
    pub fn rates(&self) -> (f64, f64) {
        self.rates.snapshot()
    }

    /// Wait until both streams are closed and the on-close callback ran.
    pub async fn wait_closed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One copy direction: read ≤ buffer from `reader`, write it all to
/// `writer`, publish the count. EOF is a clean exit; a short write is an
/// error. Shuts the writer down on the way out.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    meter: mpsc::UnboundedSender<u64>,
    mut stop: watch::Receiver<bool>,
    clean: Arc<[AtomicBool; 2]>,
    index: usize,
    label: String,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = copy_buffers().get();
    let other = 1 - index;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    clean[index].store(true, Ordering::Release);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        report(&clean, index, other, &label, &e);
                        break;
                    }
                    let _ = meter.send(n as u64);
                }
                Err(e) => {
                    report(&clean, index, other, &label, &e);
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    copy_buffers().put(buf);
}

/// Classify a direction failure: when the other direction already ended
/// cleanly, the socket underneath has been torn down and this error carries
/// no information.
fn report(clean: &[AtomicBool; 2], index: usize, other: usize, label: &str, e: &std::io::Error) {
    if clean[other].load(Ordering::Acquire) {
        clean[index].store(true, Ordering::Release);
        debug!(pair = %label, direction = index, "copy ended after peer close: {e}");
    } else {
        warn!(pair = %label, direction = index, error = %e, "copy failed");
    }
}

/// Receives byte counts from both directions; every window publishes the
/// per-direction average and clears the window. Exits once both meter
/// senders are gone.
async fn sample_rates(
    mut forward: mpsc::UnboundedReceiver<u64>,
    mut backward: mpsc::UnboundedReceiver<u64>,
    rates: Arc<PairRates>,
) {
    let mut interval = tokio::time::interval(RATE_WINDOW);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.reset();

    let (mut fwd_sum, mut bwd_sum) = (0u64, 0u64);
    let (mut fwd_open, mut bwd_open) = (true, true);

    while fwd_open || bwd_open {
        tokio::select! {
            _ = interval.tick() => {
                let secs = RATE_WINDOW.as_secs_f64();
                rates.store(fwd_sum as f64 / secs, bwd_sum as f64 / secs);
                fwd_sum = 0;
                bwd_sum = 0;
            }
            n = forward.recv(), if fwd_open => match n {
                Some(n) => fwd_sum += n,
                None => fwd_open = false,
            },
            n = backward.recv(), if bwd_open => match n {
                Some(n) => bwd_sum += n,
                None => bwd_open = false,
            },
        }
    }
}
