//! Beacon core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the beacon core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod clock;
pub mod schema;

pub mod ids {
    //! Identifier generation for anonymous and session ids.

    use uuid::Uuid;

    /// Prefix of every generated anonymous id.
    pub const ANONYMOUS_PREFIX: &str = "anon_";
    /// Prefix of every generated session id.
    pub const SESSION_PREFIX: &str = "sess_";

    /// Random id with the given prefix (UUID v4, simple form).
    pub fn new_prefixed_id(prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }

    /// Fresh device-level anonymous id.
    pub fn new_anonymous_id() -> String {
        new_prefixed_id(ANONYMOUS_PREFIX)
    }

    /// Fresh session id.
    pub fn new_session_id() -> String {
        new_prefixed_id(SESSION_PREFIX)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_are_prefixed_and_distinct() {
            let a = new_anonymous_id();
            let b = new_anonymous_id();
            assert!(a.starts_with(ANONYMOUS_PREFIX));
            assert_ne!(a, b);
        }

        #[test]
        fn id_format() {
            let s = new_session_id();
            let tail = &s[SESSION_PREFIX.len()..];
            assert_eq!(tail.len(), 32);
            assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}

pub mod envelope {
    //! Event envelope: base context merged with event properties.

    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use std::sync::{PoisonError, RwLock};

    /// Keys owned by the base context. Caller properties cannot override them.
    pub const RESERVED_KEYS: [&str; 7] =
        ["event", "user_id", "anonymous_id", "session_id", "page", "page_url", "timestamp"];

    /// Page the event was emitted from.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PageInfo {
        /// Path without the leading slash; `home` for the root path.
        pub page: String,
        /// Full URL of the page.
        pub page_url: String,
    }

    impl PageInfo {
        /// Derive the page identifier from a URL.
        pub fn from_url(url: impl Into<String>) -> Self {
            let page_url = url.into();
            let after_scheme = page_url.split_once("://").map_or(page_url.as_str(), |(_, rest)| rest);
            // The authority ends at the first of `/`, `?` or `#`.
            let rest = after_scheme.find(['/', '?', '#']).map_or("", |i| &after_scheme[i..]);
            let path = rest.split(['?', '#']).next().unwrap_or_default();
            let page = path.trim_start_matches('/');
            let page = if page.is_empty() { "home".to_owned() } else { page.to_owned() };
            Self { page, page_url }
        }
    }

    /// Accessor for the page the host is currently showing.
    pub trait PageSource: Send + Sync {
        /// Page context for an event emitted right now.
        fn current_page(&self) -> PageInfo;
    }

    /// Page source the host updates on navigation.
    #[derive(Debug)]
    pub struct CurrentPage {
        inner: RwLock<PageInfo>,
    }

    impl CurrentPage {
        /// Start at `url`.
        pub fn new(url: impl Into<String>) -> Self {
            Self { inner: RwLock::new(PageInfo::from_url(url)) }
        }

        /// Record a navigation to `url`.
        pub fn navigate(&self, url: impl Into<String>) {
            let mut w = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            *w = PageInfo::from_url(url);
        }
    }

    impl PageSource for CurrentPage {
        fn current_page(&self) -> PageInfo {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Context attached to every event.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BaseContext {
        /// Event name.
        pub event: String,
        /// Authenticated user, if any.
        pub user_id: Option<String>,
        /// Device-persistent anonymous id.
        pub anonymous_id: String,
        /// Session-scoped id.
        pub session_id: String,
        /// Originating page.
        pub page: PageInfo,
        /// Emission time, ISO-8601.
        pub timestamp: String,
    }

    impl BaseContext {
        fn into_map(self) -> Map<String, Value> {
            let mut m = Map::new();
            m.insert("event".into(), Value::String(self.event));
            m.insert("user_id".into(), self.user_id.map_or(Value::Null, Value::String));
            m.insert("anonymous_id".into(), Value::String(self.anonymous_id));
            m.insert("session_id".into(), Value::String(self.session_id));
            m.insert("page".into(), Value::String(self.page.page));
            m.insert("page_url".into(), Value::String(self.page.page_url));
            m.insert("timestamp".into(), Value::String(self.timestamp));
            m
        }
    }

    /// A composed event record. Serializes as a flat JSON object.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(transparent)]
    pub struct EventEnvelope(Value);

    impl EventEnvelope {
        /// Merge `base` with caller `properties`.
        ///
        /// Returns the envelope and the property keys that were dropped because
        /// they collide with [`RESERVED_KEYS`].
        pub fn compose(base: BaseContext, properties: Map<String, Value>) -> (Self, Vec<String>) {
            let mut fields = base.into_map();
            let mut ignored = Vec::new();
            for (k, v) in properties {
                if RESERVED_KEYS.contains(&k.as_str()) {
                    ignored.push(k);
                } else {
                    fields.insert(k, v);
                }
            }
            (Self(Value::Object(fields)), ignored)
        }

        /// Event name carried by the envelope.
        pub fn event(&self) -> Option<&str> {
            self.0.get("event").and_then(Value::as_str)
        }

        /// Look up a single field.
        pub fn get(&self, key: &str) -> Option<&Value> {
            self.0.get(key)
        }

        /// Borrow as a JSON value (for validation).
        pub fn as_value(&self) -> &Value {
            &self.0
        }

        /// Unwrap into the JSON value.
        pub fn into_value(self) -> Value {
            self.0
        }
    }

}
