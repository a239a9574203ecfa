//! Logging setup and dispatch counters for the beacon workspace.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,dispatch=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[cfg(feature = "otel")]
pub mod metrics {
    //! OTel metrics (OTLP) mirroring [`super::DispatchMetrics`].
    use super::TelemetryError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Meter};
    use opentelemetry::KeyValue;

    static METRICS_INIT: OnceCell<()> = OnceCell::new();
    static INSTR: OnceCell<Instruments> = OnceCell::new();

    fn init_metrics_from_env() -> Result<(), TelemetryError> {
        // Configure OTLP metrics pipeline via env (OTEL_EXPORTER_*).
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| TelemetryError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        Ok(())
    }

    /// Install the global OTLP meter provider once. Requires a tokio runtime.
    pub fn ensure_metrics_provider() {
        let _ = METRICS_INIT.get_or_init(|| {
            if let Err(e) = init_metrics_from_env() {
                tracing::warn!(error = %e, "otlp metrics disabled");
            }
        });
    }

    pub(crate) struct Instruments {
        events: Counter<u64>,
        batches: Counter<u64>,
    }

    impl Instruments {
        pub(crate) fn events(&self, outcome: &'static str, n: u64) {
            self.events.add(n, &[KeyValue::new("outcome", outcome)]);
        }

        pub(crate) fn batches(&self, outcome: &'static str) {
            self.batches.add(1, &[KeyValue::new("outcome", outcome)]);
        }
    }

    pub(crate) fn instruments() -> &'static Instruments {
        INSTR.get_or_init(|| {
            // Uses the global meter provider (a no-op until one is installed).
            let meter: Meter = global::meter("beacon.dispatch");
            let events = meter
                .u64_counter("beacon.events.count")
                .with_description("Events by outcome (accepted/invalid/unknown/sent)")
                .init();
            let batches = meter
                .u64_counter("beacon.batches.count")
                .with_description("Batch send attempts by outcome (sent/failed)")
                .init();
            Instruments { events, batches }
        })
    }
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// Events that passed validation and were queued.
    pub accepted: u64,
    /// Events dropped for failing their schema.
    pub invalid: u64,
    /// Events dropped because their name has no schema.
    pub unknown: u64,
    /// Events delivered in successful batches.
    pub sent: u64,
    /// Successful batch sends.
    pub batches_sent: u64,
    /// Failed batch sends (each one re-queued).
    pub send_failures: u64,
}

/// In-process counters for the tracking pipeline. Cheap to clone; clones share counts.
#[derive(Clone, Default, Debug)]
pub struct DispatchMetrics {
    accepted: Arc<AtomicU64>,
    invalid: Arc<AtomicU64>,
    unknown: Arc<AtomicU64>,
    sent: Arc<AtomicU64>,
    batches_sent: Arc<AtomicU64>,
    send_failures: Arc<AtomicU64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        let _ = self.accepted.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        metrics::instruments().events("accepted", 1);
    }

    pub fn record_invalid(&self) {
        let _ = self.invalid.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        metrics::instruments().events("invalid", 1);
    }

    pub fn record_unknown(&self) {
        let _ = self.unknown.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        metrics::instruments().events("unknown", 1);
    }

    /// A batch of `events` was delivered.
    pub fn record_batch_sent(&self, events: u64) {
        let _ = self.batches_sent.fetch_add(1, Ordering::Relaxed);
        if events > 0 {
            let _ = self.sent.fetch_add(events, Ordering::Relaxed);
        }
        #[cfg(feature = "otel")]
        {
            let inst = metrics::instruments();
            inst.batches("sent");
            inst.events("sent", events);
        }
    }

    pub fn record_send_failure(&self) {
        let _ = self.send_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        metrics::instruments().batches("failed");
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clones_share_counts() {
        let m = DispatchMetrics::new();
        let c = m.clone();
        c.record_accepted();
        c.record_unknown();
        m.record_batch_sent(3);
        m.record_send_failure();
        let s = m.snapshot();
        assert_eq!(s.accepted, 1);
        assert_eq!(s.unknown, 1);
        assert_eq!(s.invalid, 0);
        assert_eq!(s.sent, 3);
        assert_eq!(s.batches_sent, 1);
        assert_eq!(s.send_failures, 1);
    }

    proptest! {
        #[test]
        fn sent_is_sum_of_batches(sizes in proptest::collection::vec(0u64..500, 0..32)) {
            let m = DispatchMetrics::new();
            for n in &sizes {
                m.record_batch_sent(*n);
            }
            let s = m.snapshot();
            prop_assert_eq!(s.sent, sizes.iter().sum::<u64>());
            prop_assert_eq!(s.batches_sent, sizes.len() as u64);
        }
    }
}
