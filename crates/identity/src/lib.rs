//! Identity resolution: a device-persistent anonymous id and a session id.
//!
//! Ids are created lazily and written back to storage. Storage failures never
//! propagate: the caller gets a fresh, unpersisted id for that call. Without
//! storage (server-side rendering, headless hosts) fixed sentinels are returned.

#![deny(unsafe_code)]

pub mod store;

use beacon_core::ids::{new_anonymous_id, new_session_id};
use std::sync::Arc;
use tracing::warn;

pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError};

/// Storage key of the anonymous id (durable storage).
pub const ANONYMOUS_ID_KEY: &str = "anon_id";
/// Storage key of the session id (session storage).
pub const SESSION_ID_KEY: &str = "session_id";
/// Anonymous id returned when no storage is available.
pub const SERVER_ANONYMOUS_ID: &str = "server-anon";
/// Session id returned when no storage is available.
pub const SERVER_SESSION_ID: &str = "server-session";

/// Resolves ids from durable and session-scoped storage.
#[derive(Clone)]
pub struct IdentityResolver {
    durable: Option<Arc<dyn KeyValueStore>>,
    session: Option<Arc<dyn KeyValueStore>>,
}

impl IdentityResolver {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable: Some(durable), session: Some(session) }
    }

    /// Resolver for hosts without client storage; always returns the sentinels.
    pub fn server() -> Self {
        Self { durable: None, session: None }
    }

    /// Device-persistent id, created on first use.
    pub fn anonymous_id(&self) -> String {
        resolve(self.durable.as_deref(), ANONYMOUS_ID_KEY, SERVER_ANONYMOUS_ID, new_anonymous_id)
    }

    /// Session-scoped id, created on first use in each session.
    pub fn session_id(&self) -> String {
        resolve(self.session.as_deref(), SESSION_ID_KEY, SERVER_SESSION_ID, new_session_id)
    }
}

fn resolve(
    store: Option<&dyn KeyValueStore>,
    key: &str,
    sentinel: &str,
    generate: fn() -> String,
) -> String {
    let Some(store) = store else {
        return sentinel.to_owned();
    };
    match store.get(key) {
        Ok(Some(v)) if !v.is_empty() => v,
        Ok(_) => {
            let id = generate();
            if let Err(e) = store.set(key, &id) {
                warn!(key, error = %e, "identity not persisted; id is valid for this call only");
            }
            id
        }
        Err(e) => {
            warn!(key, error = %e, "identity storage unreadable; using ephemeral id");
            generate()
        }
    }
}
