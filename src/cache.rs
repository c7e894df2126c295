//! Two-tier cache for normalized text: a bounded in-process LRU in front of
//! the durable `semantic_cache` table.

use anyhow::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::store::SqliteStore;

pub struct SemanticCache {
    memory: Mutex<LruCache<String, String>>,
    store: SqliteStore,
}

impl SemanticCache {
    pub fn new(store: SqliteStore, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            store,
        }
    }

    /// Memory first, then SQLite. A durable hit is promoted into memory.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(hit) = self.memory_get(key) {
            return Ok(Some(hit));
        }

        let durable = self.store.get_semantic(key).await?;
        if let Some(text) = &durable {
            self.memory_put(key, text);
        }
        Ok(durable)
    }

    /// Write both tiers and return the value now stored under `key`.
    ///
    /// An existing durable entry wins over `value`, so racing writers all
    /// end up with the first one.
    pub async fn put(&self, key: &str, value: &str) -> Result<String> {
        self.store.put_semantic(key, value).await?;
        let stored = self
            .store
            .get_semantic(key)
            .await?
            .unwrap_or_else(|| value.to_string());
        self.memory_put(key, &stored);
        Ok(stored)
    }

    fn memory_get(&self, key: &str) -> Option<String> {
        let mut memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
        memory.get(key).cloned()
    }

    fn memory_put(&self, key: &str, value: &str) {
        let mut memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
        memory.put(key.to_string(), value.to_string());
    }
}
