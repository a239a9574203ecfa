//! Batch queue and flush scheduler.
//!
//! Validated envelopes are appended to an in-memory queue. A flush drains the
//! whole queue into one batch and hands it to the [`Transport`]:
//!
//! - size trigger: the enqueue that brings the queue to `batch_size` drains it
//!   before returning and sends on a background task;
//! - time trigger: otherwise a single timer fires `flush_interval` after the
//!   first event of a batch was queued.
//!
//! On a failed send the batch is put back in front of anything queued during
//! the attempt and a timer is armed, so delivery is at-least-once. Every queued
//! event carries its enqueue sequence number, so batches restored from
//! overlapping sends merge back in emission order. At most one timer is
//! pending at any time and every flush cancels it.

#![deny(unsafe_code)]

pub mod transport;

use beacon_core::envelope::EventEnvelope;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use telemetry::DispatchMetrics;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

pub use transport::{HttpTransport, Transport, TransportError};

/// Default number of queued events that triggers an immediate flush.
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Default delay between the first queued event and the timed flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5_000);

/// Errors from constructing a [`Dispatcher`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Batching policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Queue length that triggers an immediate flush (0 behaves as 1).
    pub batch_size: usize,
    /// Delay of the timed flush.
    pub flush_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, flush_interval: DEFAULT_FLUSH_INTERVAL }
    }
}

struct PendingFlush {
    id: u64,
    handle: JoinHandle<()>,
}

struct Queued {
    seq: u64,
    envelope: EventEnvelope,
}

#[derive(Default)]
struct State {
    /// Sorted by `seq`.
    queue: VecDeque<Queued>,
    next_seq: u64,
    timer: Option<PendingFlush>,
    next_timer_id: u64,
}

impl State {
    /// Cancel the pending timer and drain the queue.
    fn take_batch(&mut self) -> Option<Vec<Queued>> {
        if let Some(t) = self.timer.take() {
            t.handle.abort();
        }
        if self.queue.is_empty() {
            return None;
        }
        Some(self.queue.drain(..).collect())
    }
}

struct Inner {
    cfg: DispatchConfig,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    metrics: DispatchMetrics,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Owns the queue, the flush timer and the transport. Clones share one instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher on the current tokio runtime.
    pub fn new(
        cfg: DispatchConfig,
        transport: Arc<dyn Transport>,
        metrics: DispatchMetrics,
    ) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(cfg, transport, metrics, runtime))
    }

    /// Create a dispatcher that spawns its sends and timers on `runtime`.
    pub fn with_runtime(
        cfg: DispatchConfig,
        transport: Arc<dyn Transport>,
        metrics: DispatchMetrics,
        runtime: Handle,
    ) -> Self {
        let inner = Inner {
            cfg,
            transport,
            runtime,
            metrics,
            state: Mutex::new(State::default()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Append a validated envelope. Never blocks on I/O.
    pub fn enqueue(&self, envelope: EventEnvelope) {
        let batch = {
            let mut st = self.inner.lock();
            let seq = st.next_seq;
            st.next_seq += 1;
            st.queue.push_back(Queued { seq, envelope });
            let len = st.queue.len();
            if len >= self.inner.cfg.batch_size.max(1) {
                debug!(len, "batch size reached; flushing");
                st.take_batch()
            } else {
                if st.timer.is_none() {
                    self.inner.schedule_timer(&mut st);
                }
                None
            }
        };
        if let Some(batch) = batch {
            drop(self.inner.spawn_send(batch));
        }
    }

    /// Drain the queue and send it now. No-op on an empty queue.
    ///
    /// The send runs on its own task: dropping this future stops the wait,
    /// not the send, so a failed batch is still restored.
    pub async fn flush(&self) {
        let batch = self.inner.lock().take_batch();
        if let Some(batch) = batch {
            if let Err(e) = self.inner.spawn_send(batch).await {
                error!(error = %e, "batch send task did not complete");
            }
        }
    }

    /// Number of queued events.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Copy of the queued envelopes in send order.
    pub fn queued_events(&self) -> Vec<EventEnvelope> {
        self.inner.lock().queue.iter().map(|q| q.envelope.clone()).collect()
    }

    /// Whether a timed flush is scheduled.
    pub fn has_pending_flush(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Number of batch sends currently awaiting the transport.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no send is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Counters shared with the owner.
    pub fn metrics(&self) -> &DispatchMetrics {
        &self.inner.metrics
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the flush timer. Caller holds the lock and has checked no timer is pending.
    fn schedule_timer(self: &Arc<Self>, st: &mut State) {
        st.next_timer_id += 1;
        let id = st.next_timer_id;
        let deadline = Instant::now() + self.cfg.flush_interval;
        let inner = Arc::clone(self);
        let handle = self.runtime.spawn(async move {
            sleep_until(deadline).await;
            inner.on_timer(id).await;
        });
        st.timer = Some(PendingFlush { id, handle });
    }

    async fn on_timer(self: Arc<Self>, id: u64) {
        let batch = {
            let mut st = self.lock();
            // Superseded or cancelled while waking up.
            if st.timer.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            // Detach rather than abort: this task is the timer.
            st.timer = None;
            st.take_batch()
        };
        if let Some(batch) = batch {
            debug!(count = batch.len(), "flush interval elapsed; flushing");
            self.send(batch).await;
        }
    }

    fn spawn_send(self: &Arc<Self>, batch: Vec<Queued>) -> JoinHandle<()> {
        self.runtime.spawn(Arc::clone(self).send(batch))
    }

    /// Counts the send as in flight from the moment it is created.
    fn send(self: Arc<Self>, batch: Vec<Queued>) -> impl Future<Output = ()> + Send {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        async move {
            let (seqs, events): (Vec<u64>, Vec<EventEnvelope>) =
                batch.into_iter().map(|q| (q.seq, q.envelope)).unzip();
            let count = events.len();
            match self.transport.send_batch(&events).await {
                Ok(()) => {
                    self.metrics.record_batch_sent(count as u64);
                    info!(count, "batch delivered");
                }
                Err(e) => {
                    self.metrics.record_send_failure();
                    warn!(count, error = %e, "batch send failed; re-queued for next flush");
                    self.restore(seqs, events);
                }
            }
            if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.idle.notify_waiters();
            }
        }
    }

    /// Put a failed batch back, merged with the queue by sequence number.
    fn restore(self: &Arc<Self>, seqs: Vec<u64>, events: Vec<EventEnvelope>) {
        let mut st = self.lock();
        let queued = std::mem::take(&mut st.queue);
        let mut merged = VecDeque::with_capacity(queued.len() + events.len());
        let mut failed =
            seqs.into_iter().zip(events).map(|(seq, envelope)| Queued { seq, envelope }).peekable();
        let mut queued = queued.into_iter().peekable();
        loop {
            let from_failed = match (failed.peek(), queued.peek()) {
                (Some(a), Some(b)) => a.seq < b.seq,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            merged.extend(if from_failed { failed.next() } else { queued.next() });
        }
        st.queue = merged;
        if st.timer.is_none() {
            self.schedule_timer(&mut st);
        }
    }
}
