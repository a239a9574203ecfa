//! Event tracking facade.
//!
//! [`Tracker::track_event`] is the only call application code needs. It is
//! synchronous and fire-and-forget: it composes the envelope (identity, page,
//! timestamp, user), validates it against the schema contract and queues it.
//! Invalid and unknown events are logged and dropped; nothing is returned to
//! the caller and nothing panics on caller data.
//!
//! ```no_run
//! # async fn run() -> Result<(), tracker::TrackerError> {
//! use serde_json::json;
//! use tracker::{Tracker, TrackerConfig};
//!
//! let cfg = TrackerConfig::load(Some(std::path::Path::new("beacon.yaml")))?;
//! let tracker = Tracker::from_config(&cfg)?;
//! tracker.track_event("item_viewed", json!({ "item_id": "sku-42" }));
//! tracker.flush().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;

use beacon_core::clock::{Clock, SystemClock};
use beacon_core::envelope::{BaseContext, CurrentPage, EventEnvelope, PageSource};
use beacon_core::schema::{SchemaError, SchemaRegistry, ValidationError};
use dispatch::{DispatchConfig, DispatchError, Dispatcher, HttpTransport, Transport, TransportError};
use identity::{FileStore, IdentityResolver, MemoryStore, StorageError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use telemetry::DispatchMetrics;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

pub use config::{ConfigError, TrackerConfig};

/// Errors from setting a tracker up. Tracking itself never fails.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("identity storage: {0}")]
    Storage(#[from] StorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A typed event record. Serializes to the event's properties.
pub trait TrackedEvent: Serialize {
    /// Event name in the schema contract.
    const NAME: &'static str;
}

struct Inner {
    registry: Arc<SchemaRegistry>,
    identity: IdentityResolver,
    page: Arc<dyn PageSource>,
    clock: Arc<dyn Clock>,
    user_id: RwLock<Option<String>>,
    dispatcher: Dispatcher,
}

/// Tracking entry point. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

/// Assembles a [`Tracker`].
pub struct TrackerBuilder {
    registry: Arc<SchemaRegistry>,
    transport: Arc<dyn Transport>,
    identity: Option<IdentityResolver>,
    page: Option<Arc<dyn PageSource>>,
    clock: Option<Arc<dyn Clock>>,
    dispatch: DispatchConfig,
    user_id: Option<String>,
    metrics: DispatchMetrics,
}

impl TrackerBuilder {
    /// Defaults to in-memory identity stores.
    pub fn identity(mut self, identity: IdentityResolver) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Where `page`/`page_url` come from. Defaults to `app://localhost/`.
    pub fn page_source(mut self, page: Arc<dyn PageSource>) -> Self {
        self.page = Some(page);
        self
    }

    /// Timestamp source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Batching policy. Defaults to 20 events or 5 s.
    pub fn dispatch_config(mut self, cfg: DispatchConfig) -> Self {
        self.dispatch = cfg;
        self
    }

    /// Initial user; see [`Tracker::set_user_id`].
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Share counters with another owner.
    pub fn metrics(mut self, metrics: DispatchMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build on the current tokio runtime.
    pub fn build(self) -> Result<Tracker, TrackerError> {
        let dispatcher = Dispatcher::new(self.dispatch, self.transport, self.metrics)?;
        let identity = self.identity.unwrap_or_else(|| {
            IdentityResolver::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
        });
        let inner = Inner {
            registry: self.registry,
            identity,
            page: self.page.unwrap_or_else(|| Arc::new(CurrentPage::new("app://localhost/"))),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            user_id: RwLock::new(self.user_id),
            dispatcher,
        };
        Ok(Tracker { inner: Arc::new(inner) })
    }
}

impl Tracker {
    /// Start a builder around a loaded registry and a transport.
    pub fn builder(registry: Arc<SchemaRegistry>, transport: Arc<dyn Transport>) -> TrackerBuilder {
        TrackerBuilder {
            registry,
            transport,
            identity: None,
            page: None,
            clock: None,
            dispatch: DispatchConfig::default(),
            user_id: None,
            metrics: DispatchMetrics::new(),
        }
    }

    /// Stand up the production stack: schema file, HTTP transport, file-backed identity.
    pub fn from_config(cfg: &TrackerConfig) -> Result<Self, TrackerError> {
        let schema_path = cfg.schema_path.as_ref().ok_or(ConfigError::MissingSchemaPath)?;
        if cfg.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint.into());
        }
        let registry = SchemaRegistry::from_path(schema_path)?;
        let transport = HttpTransport::new(cfg.endpoint.clone(), cfg.request_timeout())?;
        let identity = match &cfg.identity_path {
            Some(p) => {
                IdentityResolver::new(Arc::new(FileStore::open(p)?), Arc::new(MemoryStore::new()))
            }
            None => IdentityResolver::server(),
        };
        Self::builder(Arc::new(registry), Arc::new(transport))
            .dispatch_config(cfg.dispatch_config())
            .identity(identity)
            .page_source(Arc::new(CurrentPage::new(cfg.page_url.clone())))
            .build()
    }

    /// Install (or clear) the authenticated user for subsequent events.
    pub fn set_user_id(&self, user_id: Option<String>) {
        let mut w = self.inner.user_id.write().unwrap_or_else(PoisonError::into_inner);
        *w = user_id;
    }

    /// Track `event_name` with `properties` (a JSON object) for the current user.
    pub fn track_event(&self, event_name: &str, properties: Value) {
        let user = self.inner.user_id.read().unwrap_or_else(PoisonError::into_inner).clone();
        self.track_event_as(user.as_deref(), event_name, properties);
    }

    /// Track with an explicit user id for this call only.
    pub fn track_event_as(&self, user_id: Option<&str>, event_name: &str, properties: Value) {
        let metrics = self.inner.dispatcher.metrics();
        let properties = match properties {
            Value::Object(m) => m,
            Value::Null => Map::new(),
            other => {
                metrics.record_invalid();
                error!(event = event_name, got = json_kind(&other), "event properties must be a JSON object; dropped");
                return;
            }
        };

        let base = BaseContext {
            event: event_name.to_owned(),
            user_id: user_id.map(str::to_owned),
            anonymous_id: self.inner.identity.anonymous_id(),
            session_id: self.inner.identity.session_id(),
            page: self.inner.page.current_page(),
            timestamp: self.inner.clock.now_iso(),
        };
        let (envelope, ignored) = EventEnvelope::compose(base, properties);
        if !ignored.is_empty() {
            debug!(event = event_name, ?ignored, "reserved keys in properties ignored");
        }

        match self.inner.registry.validate(event_name, envelope.as_value()) {
            Ok(()) => {
                metrics.record_accepted();
                self.inner.dispatcher.enqueue(envelope);
            }
            Err(ValidationError::UnknownEvent(_)) => {
                metrics.record_unknown();
                warn!(event = event_name, "no schema registered for event; dropped (schema contract out of date?)");
            }
            Err(ValidationError::Invalid { errors, .. }) => {
                metrics.record_invalid();
                error!(event = event_name, ?errors, "analytics schema validation failed; event dropped");
            }
        }
    }

    /// Track a typed event.
    pub fn track<E: TrackedEvent>(&self, event: &E) {
        match serde_json::to_value(event) {
            Ok(v) => self.track_event(E::NAME, v),
            Err(e) => {
                self.inner.dispatcher.metrics().record_invalid();
                error!(event = E::NAME, error = %e, "event did not serialize; dropped");
            }
        }
    }

    /// Send whatever is queued now. For explicit teardown points; never implicit.
    pub async fn flush(&self) {
        self.inner.dispatcher.flush().await;
    }

    /// Flush, then wait up to `grace` for in-flight sends. Returns the number
    /// of events still queued, which is non-zero if a send failed.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.flush().await;
        if timeout(grace, self.inner.dispatcher.wait_idle()).await.is_err() {
            warn!(in_flight = self.in_flight(), "shutdown grace period elapsed");
        }
        self.queue_len()
    }

    /// Events validated but not yet sent.
    pub fn queue_len(&self) -> usize {
        self.inner.dispatcher.queue_len()
    }

    /// Batch sends awaiting the transport.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    pub fn has_pending_flush(&self) -> bool {
        self.inner.dispatcher.has_pending_flush()
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        self.inner.dispatcher.metrics()
    }

    /// The contract events are validated against.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }
}

const fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
