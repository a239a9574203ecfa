//! Clock abstraction for event timestamps, with a controllable test clock.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{Mutex, PoisonError};

/// Source of wall-clock time in milliseconds since UNIX epoch.
pub trait Clock: Send + Sync {
    /// Milliseconds since UNIX epoch.
    fn now_ms(&self) -> u64;

    /// Current time as an ISO-8601 UTC string.
    fn now_iso(&self) -> String {
        to_iso8601(self.now_ms())
    }
}

/// System (production) clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Timestamp source that only moves when told to, for reproducible envelopes.
#[derive(Debug)]
pub struct VirtualClock {
    epoch_ms: Mutex<u64>,
}

impl VirtualClock {
    /// Every event is stamped `epoch_ms` until the clock is moved.
    pub fn new(epoch_ms: u64) -> Self {
        Self { epoch_ms: Mutex::new(epoch_ms) }
    }

    /// Move forward; saturates instead of wrapping.
    pub fn advance_ms(&self, delta_ms: u64) {
        let mut now = self.epoch_ms.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(delta_ms);
    }

    /// Jump to `epoch_ms`, backwards included.
    pub fn set_ms(&self, epoch_ms: u64) {
        *self.epoch_ms.lock().unwrap_or_else(PoisonError::into_inner) = epoch_ms;
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        *self.epoch_ms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Format epoch milliseconds as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn to_iso8601(ms: u64) -> String {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
