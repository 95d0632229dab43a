//! LocalStore trait: synchronous key-value storage that survives restarts.
//!
//! Implementations:
//! - `MemoryStore` - For testing
//! - `FileStore` (in roster-daemon) - One JSON file per key on disk

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Cached application state.
pub const STATE_KEY: &str = "roster.state";
/// Authentication-session flag (`"true"` when signed in).
pub const SESSION_KEY: &str = "roster.session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Local persistent key-value store.
///
/// Writes are synchronous so that local durability never waits on the network.
pub trait LocalStore: Send + Sync {
    /// Read a value. Missing keys are `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store for testing.
///
/// Clones share the same map, so a test can keep a handle and "restart" by
/// building a new container over a clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: std::sync::Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}
