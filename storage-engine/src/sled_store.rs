use crate::entry::StoredEntry;
use async_trait::async_trait;
use bytes::Bytes;
use hoard::domain::{CachedValue, CasToken};
use hoard::ports::{CacheStore, ProgressFn};
use shared::{Error, Result};
use std::fmt::Debug;
use std::path::Path;
use tracing::{debug, warn};

/// Report purge progress every this many scanned entries
const PROGRESS_INTERVAL: usize = 100;

/// Sled-backed persistent store
///
/// Entries are JSON-encoded [`StoredEntry`] records. Revisions come from
/// sled's monotonic id generator, so CAS tokens stay unique across restarts.
pub struct SledStore {
    db: sled::Db,
}

fn sled_error(context: &'static str) -> impl Fn(sled::Error) -> Error {
    move |e| Error::Storage(format!("{}: {}", context, e))
}

impl SledStore {
    /// Open or create a store at `path`
    /// Creates the parent directory if it doesn't exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let db = sled::open(path).map_err(sled_error("Failed to open Sled database"))?;

        Ok(Self { db })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(sled_error("Failed to flush database"))?;
        Ok(())
    }

    fn encode(&self, value: Bytes, expiry: u64) -> Result<Vec<u8>> {
        let revision = self
            .db
            .generate_id()
            .map_err(sled_error("Failed to generate revision"))?;
        serde_json::to_vec(&StoredEntry::new(value, revision, expiry))
            .map_err(|e| Error::Serialization(format!("Failed to serialize entry: {}", e)))
    }

    fn decode(raw: &[u8]) -> Result<StoredEntry> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize entry: {}", e)))
    }

    fn read(&self, key: &str) -> Result<Option<(sled::IVec, StoredEntry)>> {
        let raw = self
            .db
            .get(key.as_bytes())
            .map_err(sled_error("Failed to read entry"))?;

        match raw {
            Some(raw) => {
                let entry = Self::decode(&raw)?;
                Ok(Some((raw, entry)))
            }
            None => Ok(None),
        }
    }

    /// Swap `expected` for `new`; a concurrent writer makes this return false
    fn swap(&self, key: &str, expected: Option<sled::IVec>, new: Option<Vec<u8>>) -> Result<bool> {
        let outcome = self
            .db
            .compare_and_swap(key.as_bytes(), expected, new)
            .map_err(sled_error("Failed to swap entry"))?;
        Ok(outcome.is_ok())
    }
}

#[async_trait]
impl CacheStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        Ok(self
            .read(key)?
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.to_cached(true)))
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let encoded = self.encode(value, expiry)?;
        self.db
            .insert(key.as_bytes(), encoded)
            .map_err(sled_error("Failed to write entry"))?;
        Ok(true)
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let expected = match self.read(key)? {
            Some((_, entry)) if !entry.is_expired() => return Ok(false),
            Some((raw, _)) => Some(raw),
            None => None,
        };
        let encoded = self.encode(value, expiry)?;
        self.swap(key, expected, Some(encoded))
    }

    async fn cas(&self, token: CasToken, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let raw = match self.read(key)? {
            Some((raw, entry)) if entry.revision == token.0 && !entry.is_expired() => raw,
            _ => {
                debug!("CAS on '{}' with stale token {}", key, token.0);
                return Ok(false);
            }
        };
        let encoded = self.encode(value, expiry)?;
        self.swap(key, Some(raw), Some(encoded))
    }

    async fn delete(&self, key: &str, _delay: u64) -> Result<bool> {
        self.db
            .remove(key.as_bytes())
            .map_err(sled_error("Failed to delete entry"))?;
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
        let total = self.db.len().max(1);
        let mut purged = 0usize;

        for (scanned, item) in self.db.iter().enumerate() {
            let (key, raw) = item.map_err(sled_error("Failed to iterate database"))?;

            let entry = match Self::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping undecodable entry during purge: {}", e);
                    continue;
                }
            };

            if entry.expires_at != 0 && entry.expires_at < before {
                // Leave the entry alone if it was rewritten since we read it
                let removed = self
                    .db
                    .compare_and_swap(&key, Some(&raw), None as Option<&[u8]>)
                    .map_err(sled_error("Failed to purge entry"))?;
                if removed.is_ok() {
                    purged += 1;
                }
            }

            if let Some(progress) = progress {
                if (scanned + 1) % PROGRESS_INTERVAL == 0 {
                    progress(((scanned + 1) as f64 / total as f64 * 100.0).min(100.0));
                }
            }
        }

        if let Some(progress) = progress {
            progress(100.0);
        }
        self.flush()?;

        debug!("Purged {} entries expiring before {}", purged, before);
        Ok(true)
    }
}

impl Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("entries", &self.db.len())
            .finish()
    }
}
