//! Tracker configuration: YAML file plus `BEACON_*` environment overrides.

use dispatch::{DispatchConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_ENDPOINT: &str = "BEACON_ENDPOINT";
pub const ENV_BATCH_SIZE: &str = "BEACON_BATCH_SIZE";
pub const ENV_FLUSH_INTERVAL_MS: &str = "BEACON_FLUSH_INTERVAL_MS";
pub const ENV_SCHEMA_PATH: &str = "BEACON_SCHEMA_PATH";
pub const ENV_IDENTITY_PATH: &str = "BEACON_IDENTITY_PATH";

/// Errors from loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("no ingest endpoint configured")]
    MissingEndpoint,
    #[error("no schema contract path configured")]
    MissingSchemaPath,
}

/// Everything needed to stand up a [`crate::Tracker`] from outside the code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ingest URL receiving `POST {"events": [...]}`.
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Schema contract document.
    pub schema_path: Option<PathBuf>,
    /// Durable identity file. Without it ids fall back to the server sentinels.
    pub identity_path: Option<PathBuf>,
    /// Page reported on events from hosts without navigation.
    pub page_url: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: u64::try_from(DEFAULT_FLUSH_INTERVAL.as_millis()).unwrap_or(5_000),
            request_timeout_ms: 10_000,
            schema_path: None,
            identity_path: None,
            page_url: "app://localhost/".to_owned(),
        }
    }
}

impl TrackerConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }

    /// File (if given) or defaults, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_yaml_path(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Apply `BEACON_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from any `BEACON_*` lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_ENDPOINT) {
            self.endpoint = v;
        }
        if let Some(v) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = parse(ENV_BATCH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_FLUSH_INTERVAL_MS) {
            self.flush_interval_ms = parse(ENV_FLUSH_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_SCHEMA_PATH) {
            self.schema_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(ENV_IDENTITY_PATH) {
            self.identity_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { key, value: value.to_owned() })
}
