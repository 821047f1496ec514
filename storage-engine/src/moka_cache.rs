use crate::entry::StoredEntry;
use async_trait::async_trait;
use bytes::Bytes;
use hoard::domain::{CachedValue, CasToken};
use hoard::ports::{CacheStore, ProgressFn};
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use shared::Result;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-entry expiry driven by the absolute time stored with the value
struct EntryExpiry;

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.time_to_live()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.time_to_live()
    }
}

/// Moka-based cache implementation with per-entry expiry and native CAS
/// Conditional writes go through moka's entry compute API, which serialises
/// them per key
pub struct MokaStore {
    cache: Cache<String, StoredEntry>,
    revisions: AtomicU64,
}

impl MokaStore {
    /// Create a Moka store from name and optional capacity
    pub fn new(name: String, max_entries: Option<u64>) -> Self {
        let mut builder = Cache::builder().name(&name).expire_after(EntryExpiry);

        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }

        Self {
            cache: builder.build(),
            revisions: AtomicU64::new(1),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::Relaxed)
    }

    fn entry(&self, value: Bytes, expiry: u64) -> StoredEntry {
        StoredEntry::new(value, self.next_revision(), expiry)
    }
}

#[async_trait]
impl CacheStore for MokaStore {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        // Moka evicts lazily; an entry past its time may still be resident
        Ok(self
            .cache
            .get(key)
            .await
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.to_cached(true)))
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let entry = self.entry(value, expiry);
        self.cache.insert(key.to_string(), entry).await;
        Ok(true)
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let entry = self.entry(value, expiry);
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|existing| {
                let occupied = existing.is_some_and(|current| !current.value().is_expired());
                let op = if occupied { Op::Nop } else { Op::Put(entry) };
                std::future::ready(op)
            })
            .await;

        Ok(matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_)))
    }

    async fn cas(&self, token: CasToken, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let entry = self.entry(value, expiry);
        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|existing| {
                let matches = existing.is_some_and(|current| {
                    let current = current.value();
                    current.revision == token.0 && !current.is_expired()
                });
                let op = if matches { Op::Put(entry) } else { Op::Nop };
                std::future::ready(op)
            })
            .await;

        let swapped = matches!(result, CompResult::ReplacedWith(_));
        if !swapped {
            debug!("CAS on '{}' with stale token {}", key, token.0);
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str, _delay: u64) -> Result<bool> {
        self.cache.invalidate(key).await;
        Ok(true)
    }

    fn supports_cas(&self) -> bool {
        true
    }

    async fn delete_objects_expiring_before(
        &self,
        before: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<bool> {
        let doomed: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.expires_at != 0 && entry.expires_at < before)
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        let total = doomed.len();
        for (done, key) in doomed.iter().enumerate() {
            self.cache.invalidate(key).await;
            if let Some(progress) = progress {
                progress((done + 1) as f64 / total as f64 * 100.0);
            }
        }
        debug!("Purged {} entries expiring before {}", total, before);
        Ok(true)
    }
}

impl Debug for MokaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStore")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}
