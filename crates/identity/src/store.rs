//! Key-value storage capability and its in-memory and file-backed implementations.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors emitted by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store file {0} is not a JSON object")]
    Corrupt(PathBuf),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// String key-value storage (browser-style `getItem`/`setItem`).
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Write `value` under `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Session-scoped store: values live as long as the store does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every value, as when a new session starts.
    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Durable store persisted as a single JSON object file.
///
/// The file is loaded on open and rewritten (temp file + rename) on every `set`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Map::new()
            } else {
                match serde_json::from_str::<Value>(&raw)? {
                    Value::Object(m) => m,
                    _ => return Err(StorageError::Corrupt(path)),
                }
            }
        } else {
            Map::new()
        };
        Ok(Self { path, values: Mutex::new(values) })
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let g = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(g.get(key).and_then(Value::as_str).map(str::to_owned))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut g = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = g.insert(key.to_owned(), Value::String(value.to_owned()));
        if let Err(e) = self.persist(&g) {
            // Keep memory consistent with disk.
            match previous {
                Some(v) => g.insert(key.to_owned(), v),
                None => g.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}
