use crate::entry::StoredEntry;
use async_trait::async_trait;
use bytes::Bytes;
use foyer::{Cache, CacheBuilder};
use hoard::domain::CachedValue;
use hoard::ports::CacheStore;
use parking_lot::Mutex;
use shared::Result;
use std::fmt::Debug;
use std::sync::Arc;

/// Foyer-based in-memory cache implementation
///
/// Foyer has no compare-exchange, so this store hands out no CAS tokens and
/// merges against it go through the distributed lock. Expiry is checked on
/// read; expired entries linger until evicted or overwritten.
pub struct FoyerStore {
    cache: Arc<Cache<String, StoredEntry>>,
    /// Serialises `add` so the check and the insert happen as one step
    add_guard: Mutex<()>,
}

impl FoyerStore {
    /// Create a new Foyer in-memory store with the given memory capacity in bytes
    pub fn new(name: String, mem_bytes: usize) -> Self {
        let cache = CacheBuilder::new(mem_bytes).with_name(name).build();

        Self {
            cache: Arc::new(cache),
            add_guard: Mutex::new(()),
        }
    }

    fn live(&self, key: &str) -> Option<StoredEntry> {
        let entry = self.cache.get(key)?;
        let stored = entry.value();
        if stored.is_expired() {
            return None;
        }
        Some(stored.clone())
    }
}

#[async_trait]
impl CacheStore for FoyerStore {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        Ok(self.live(key).map(|entry| entry.to_cached(false)))
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        // No CAS here, so no revision to track
        self.cache
            .insert(key.to_string(), StoredEntry::new(value, 0, expiry));
        Ok(true)
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let _guard = self.add_guard.lock();
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.cache
            .insert(key.to_string(), StoredEntry::new(value, 0, expiry));
        Ok(true)
    }

    async fn delete(&self, key: &str, _delay: u64) -> Result<bool> {
        self.cache.remove(key);
        Ok(true)
    }
}

impl Debug for FoyerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoyerStore")
            .field("cache", &"<foyer::Cache>")
            .finish()
    }
}
