//! Event schema registry and validator.
//!
//! The contract is an OpenAPI-style JSON document whose `components.schemas`
//! object maps each event name to a JSON Schema (draft 7). Event schemas may
//! `$ref` shared definitions in the same document, e.g. a base schema holding
//! the fields every event carries. Each key of `components.schemas` is a
//! registered event name.
//!
//! Validation is pure and synchronous.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading a schema contract.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error("contract has no `components.schemas` object")]
    MissingSchemas,
    #[error("schema for event `{event}` does not compile: {reason}")]
    Compile { event: String, reason: String },
}

/// Why an event was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// No schema is registered under the name (caller/registry mismatch).
    #[error("no schema registered for event `{0}`")]
    UnknownEvent(String),
    /// The payload does not satisfy the event's schema.
    #[error("event `{event}` failed schema validation: {}", errors.join("; "))]
    Invalid { event: String, errors: Vec<String> },
}

/// Immutable map of event name to compiled schema.
pub struct SchemaRegistry {
    validators: BTreeMap<String, JSONSchema>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry").field("events", &self.event_names()).finish()
    }
}

impl SchemaRegistry {
    /// Compile every schema in a contract document.
    pub fn from_value(contract: &Value) -> Result<Self, SchemaError> {
        let schemas = contract
            .pointer("/components/schemas")
            .and_then(Value::as_object)
            .ok_or(SchemaError::MissingSchemas)?;

        let mut validators = BTreeMap::new();
        for (name, schema) in schemas {
            // `$ref` targets compile lazily; check the event schema itself up front.
            compile(schema).map_err(|reason| SchemaError::Compile { event: name.clone(), reason })?;
            // Compile against the whole document so local `$ref`s resolve.
            let mut root = contract.clone();
            if let Value::Object(map) = &mut root {
                map.insert(
                    "$ref".to_owned(),
                    Value::String(format!("#/components/schemas/{}", escape_pointer(name))),
                );
            }
            let compiled =
                compile(&root).map_err(|reason| SchemaError::Compile { event: name.clone(), reason })?;
            validators.insert(name.clone(), compiled);
        }
        Ok(Self { validators })
    }

    /// Parse and compile a contract from JSON text.
    pub fn from_json_str(s: &str) -> Result<Self, SchemaError> {
        let v: Value = serde_json::from_str(s)?;
        Self::from_value(&v)
    }

    /// Read, parse and compile a contract file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<&str> {
        self.validators.keys().map(String::as_str).collect()
    }

    /// Whether `event` has a schema.
    pub fn contains(&self, event: &str) -> bool {
        self.validators.contains_key(event)
    }

    /// Validate a candidate envelope against the schema registered for `event`.
    pub fn validate(&self, event: &str, payload: &Value) -> Result<(), ValidationError> {
        let schema = self
            .validators
            .get(event)
            .ok_or_else(|| ValidationError::UnknownEvent(event.to_owned()))?;
        schema.validate(payload).map_err(|iter| {
            let errors = iter
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            ValidationError::Invalid { event: event.to_owned(), errors }
        })
    }
}

fn compile(schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::options().with_draft(Draft::Draft7).compile(schema).map_err(|e| e.to_string())
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
