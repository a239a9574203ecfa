use async_trait::async_trait;
use beacon_core::envelope::{BaseContext, EventEnvelope, PageInfo};
use dispatch::{DispatchConfig, Dispatcher, Transport, TransportError};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry::DispatchMetrics;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

/// Records delivered batches; fails the first `failures` attempts.
#[derive(Default)]
struct MockTransport {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    delivered: Mutex<Vec<Vec<EventEnvelope>>>,
}

impl MockTransport {
    fn failing(n: usize) -> Self {
        Self { failures: AtomicUsize::new(n), ..Self::default() }
    }
    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
    fn delivered(&self) -> Vec<Vec<EventEnvelope>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_batch(&self, events: &[EventEnvelope]) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(TransportError::Rejected("ingest unavailable".into()));
        }
        self.delivered.lock().unwrap().push(events.to_vec());
        Ok(())
    }
}

/// Blocks every send until released, then fails it.
#[derive(Default)]
struct GatedFailure {
    gate: Notify,
    attempts: AtomicUsize,
    calls: Mutex<Vec<Vec<EventEnvelope>>>,
}

#[async_trait]
impl Transport for GatedFailure {
    async fn send_batch(&self, events: &[EventEnvelope]) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(events.to_vec());
        self.gate.notified().await;
        Err(TransportError::Status(503))
    }
}

/// Takes a minute to answer, then fails.
struct SlowFailure;

#[async_trait]
impl Transport for SlowFailure {
    async fn send_batch(&self, _: &[EventEnvelope]) -> Result<(), TransportError> {
        sleep(Duration::from_secs(60)).await;
        Err(TransportError::Status(504))
    }
}

fn envelope(seq: u64) -> EventEnvelope {
    let base = BaseContext {
        event: "item_viewed".into(),
        user_id: None,
        anonymous_id: "anon_test".into(),
        session_id: "sess_test".into(),
        page: PageInfo::from_url("https://shop.example.com/marketplace"),
        timestamp: "2024-05-01T10:00:00.000Z".into(),
    };
    let props = json!({ "item_id": format!("sku-{seq}"), "seq": seq });
    EventEnvelope::compose(base, props.as_object().cloned().unwrap()).0
}

fn seqs(events: &[EventEnvelope]) -> Vec<u64> {
    events.iter().map(|e| e.get("seq").and_then(Value::as_u64).unwrap()).collect()
}

fn dispatcher(batch_size: usize, transport: Arc<dyn Transport>) -> Dispatcher {
    let cfg = DispatchConfig { batch_size, flush_interval: Duration::from_millis(5_000) };
    Dispatcher::new(cfg, transport, DispatchMetrics::new()).unwrap()
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn flush_on_empty_queue_is_a_noop() {
    let t = Arc::new(MockTransport::default());
    let d = dispatcher(20, t.clone());
    d.flush().await;
    settle().await;
    assert_eq!(t.attempts(), 0);
    assert!(!d.has_pending_flush());
}

#[tokio::test(start_paused = true)]
async fn size_threshold_flushes_within_the_same_call() {
    let t = Arc::new(MockTransport::default());
    let d = dispatcher(20, t.clone());
    for i in 0..19 {
        d.enqueue(envelope(i));
    }
    assert_eq!(d.queue_len(), 19);
    assert!(d.has_pending_flush());

    d.enqueue(envelope(19));
    assert_eq!(d.queue_len(), 0, "drained before enqueue returns");
    assert!(!d.has_pending_flush(), "size trigger cancels the timer");

    settle().await;
    let batches = t.delivered();
    assert_eq!(batches.len(), 1);
    assert_eq!(seqs(&batches[0]), (0..20).collect::<Vec<_>>());

    // The cancelled timer never fires.
    sleep(Duration::from_millis(10_000)).await;
    assert_eq!(t.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn interval_triggers_exactly_one_flush() {
    let t = Arc::new(MockTransport::default());
    let d = dispatcher(20, t.clone());
    d.enqueue(envelope(1));
    sleep(Duration::from_millis(4_999)).await;
    assert_eq!(t.attempts(), 0);
    assert_eq!(d.queue_len(), 1);

    sleep(Duration::from_millis(2)).await;
    assert_eq!(t.attempts(), 1);
    assert_eq!(d.queue_len(), 0);
    assert!(!d.has_pending_flush());

    sleep(Duration::from_millis(20_000)).await;
    assert_eq!(t.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn one_timer_for_many_enqueues() {
    let t = Arc::new(MockTransport::default());
    let d = dispatcher(20, t.clone());
    for i in 0..5 {
        d.enqueue(envelope(i));
        assert!(d.has_pending_flush());
        sleep(Duration::from_millis(100)).await;
    }
    // Timer was armed by the first event only.
    sleep(Duration::from_millis(4_600)).await;
    let batches = t.delivered();
    assert_eq!(batches.len(), 1);
    assert_eq!(seqs(&batches[0]), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_cancels_the_timer() {
    let t = Arc::new(MockTransport::default());
    let d = dispatcher(20, t.clone());
    d.enqueue(envelope(1));
    assert!(d.has_pending_flush());
    d.flush().await;
    assert!(!d.has_pending_flush());
    assert_eq!(t.attempts(), 1);

    sleep(Duration::from_millis(10_000)).await;
    assert_eq!(t.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_batch_is_restored_and_retried_on_timer() {
    let t = Arc::new(MockTransport::failing(1));
    let d = dispatcher(20, t.clone());
    for i in 0..20 {
        d.enqueue(envelope(i));
    }
    settle().await;
    assert_eq!(t.attempts(), 1);
    assert_eq!(d.queue_len(), 20);
    assert_eq!(seqs(&d.queued_events()), (0..20).collect::<Vec<_>>());
    assert!(d.has_pending_flush(), "failure re-arms the timer");

    sleep(Duration::from_millis(5_001)).await;
    assert_eq!(t.attempts(), 2);
    assert_eq!(d.queue_len(), 0);
    let batches = t.delivered();
    assert_eq!(batches.len(), 1);
    assert_eq!(seqs(&batches[0]), (0..20).collect::<Vec<_>>());

    let m = d.metrics().snapshot();
    assert_eq!(m.send_failures, 1);
    assert_eq!(m.batches_sent, 1);
    assert_eq!(m.sent, 20);
}

#[tokio::test(start_paused = true)]
async fn events_queued_during_a_send_stay_behind_the_restored_batch() {
    let t = Arc::new(GatedFailure::default());
    let d = dispatcher(3, t.clone());
    for i in 0..3 {
        d.enqueue(envelope(i));
    }
    settle().await;
    assert_eq!(t.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(d.queue_len(), 0);

    // Arrive while the first batch is in flight; below threshold, so no second send.
    d.enqueue(envelope(3));
    d.enqueue(envelope(4));
    settle().await;
    assert_eq!(t.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(seqs(&d.queued_events()), vec![3, 4]);

    t.gate.notify_one();
    settle().await;
    assert_eq!(seqs(&d.queued_events()), vec![0, 1, 2, 3, 4]);
    assert!(d.has_pending_flush());
}

#[tokio::test(start_paused = true)]
async fn wait_idle_resolves_after_in_flight_sends() {
    let t = Arc::new(GatedFailure::default());
    let d = dispatcher(2, t.clone());
    d.wait_idle().await;

    d.enqueue(envelope(0));
    d.enqueue(envelope(1));
    assert_eq!(d.in_flight(), 1, "counted before the task first runs");

    let waiter = {
        let d = d.clone();
        tokio::spawn(async move { d.wait_idle().await })
    };
    settle().await;
    assert!(!waiter.is_finished());

    t.gate.notify_one();
    waiter.await.unwrap();
    assert_eq!(d.in_flight(), 0);
    assert_eq!(d.queue_len(), 2);
}

#[tokio::test(start_paused = true)]
async fn size_trigger_during_a_send_sends_only_new_events() {
    let t = Arc::new(GatedFailure::default());
    let d = dispatcher(3, t.clone());
    for i in 0..3 {
        d.enqueue(envelope(i));
    }
    settle().await;
    for i in 3..6 {
        d.enqueue(envelope(i));
    }
    assert_eq!(d.queue_len(), 0);
    settle().await;

    let calls = t.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(seqs(&calls[0]), vec![0, 1, 2]);
    assert_eq!(seqs(&calls[1]), vec![3, 4, 5]);

    // Whichever send fails first, the restored queue is in emission order.
    t.gate.notify_one();
    settle().await;
    assert_eq!(d.queue_len(), 3);
    t.gate.notify_one();
    settle().await;
    assert_eq!(seqs(&d.queued_events()), (0..6).collect::<Vec<_>>());
    assert_eq!(d.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_flush_still_restores_its_batch() {
    let d = dispatcher(20, Arc::new(SlowFailure));
    d.enqueue(envelope(0));
    d.enqueue(envelope(1));

    let waited = timeout(Duration::from_millis(100), d.flush()).await;
    assert!(waited.is_err());
    assert_eq!(d.in_flight(), 1, "send keeps running after the caller gave up");

    timeout(Duration::from_secs(120), d.wait_idle()).await.unwrap();
    assert_eq!(d.in_flight(), 0);
    assert_eq!(seqs(&d.queued_events()), vec![0, 1]);
    assert!(d.has_pending_flush());
    assert_eq!(d.metrics().snapshot().send_failures, 1);
}

proptest! {
    #[test]
    fn failed_flush_preserves_queue_exactly(n in 1u64..60) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let t = Arc::new(MockTransport::failing(usize::MAX));
            let d = dispatcher(1_000, t.clone());
            for i in 0..n {
                d.enqueue(envelope(i));
            }
            d.flush().await;
            prop_assert_eq!(t.attempts(), 1);
            prop_assert_eq!(seqs(&d.queued_events()), (0..n).collect::<Vec<_>>());
            prop_assert!(d.has_pending_flush());
            Ok(())
        })?;
    }
}
