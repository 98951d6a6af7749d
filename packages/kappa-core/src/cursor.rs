//! Versioned cursor store.
//!
//! A [`CursorStore`] persists plain integers by key. [`CursorState`] scopes a
//! store to one flow (or one child of a merged source) and lays out two kinds
//! of keys under its prefix:
//!
//! - `{prefix}!state!{name}` - cursor position for the named log
//! - `{prefix}!version!` - version of the view indexed from these cursors

use crate::error::{KappaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Durable integer key/value store.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    async fn put(&self, key: &str, value: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store, for tests and ephemeral views.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCursorStore {
    entries: Arc<Mutex<HashMap<String, u64>>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.lock().get(key).copied())
    }

    async fn put(&self, key: &str, value: u64) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Cursor and version state of one flow, stored under a key prefix.
#[derive(Clone)]
pub struct CursorState {
    store: Arc<dyn CursorStore>,
    prefix: String,
}

impl CursorState {
    pub fn new(store: Arc<dyn CursorStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemoryCursorStore::new()), prefix)
    }

    pub fn namespace(&self) -> &str {
        &self.prefix
    }

    /// Nested state sharing the same store.
    pub fn scoped(&self, sub: &str) -> Self {
        Self {
            store: self.store.clone(),
            prefix: format!("{}/{}", self.prefix, sub),
        }
    }

    fn state_key(&self, name: &str) -> String {
        format!("{}!state!{}", self.prefix, name)
    }

    fn version_key(&self) -> String {
        format!("{}!version!", self.prefix)
    }

    pub async fn get(&self, name: &str) -> Result<Option<u64>> {
        self.store.get(&self.state_key(name)).await
    }

    pub async fn put(&self, name: &str, seq: u64) -> Result<()> {
        self.store.put(&self.state_key(name), seq).await
    }

    /// Stored view version. Zero reads as absent.
    pub async fn fetch_version(&self) -> Result<Option<u32>> {
        match self.store.get(&self.version_key()).await? {
            None | Some(0) => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| KappaError::storage(format!("stored version {} out of range", v))),
        }
    }

    pub async fn store_version(&self, version: u32) -> Result<()> {
        self.store.put(&self.version_key(), u64::from(version)).await
    }
}

impl fmt::Debug for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorState")
            .field("prefix", &self.prefix)
            .finish()
    }
}
