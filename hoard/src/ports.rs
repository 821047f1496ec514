#![deny(clippy::all)]

use crate::domain::{CachedValue, CasToken, StoreConfig};
use async_trait::async_trait;
use bytes::Bytes;
use shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

// Ports are the pluggable extension points for underlying cache implementations

/// Progress callback for long-running maintenance, receives a percentage
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Port for creating cache storage from configuration
/// This allows different storage backends to be plugged in
pub trait StorageFactory: Send + Sync + 'static {
    /// Create a new cache store from configuration
    fn create_from_config(&self, config: &StoreConfig) -> Result<Arc<dyn CacheStore>>;
}

/// Raw key-value primitives a backend provides.
///
/// Expiry arguments follow the convention in [`crate::expiry`]. Losing a race
/// is reported as `Ok(false)`; `Err` is reserved for the store itself failing.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Read a value. The CAS token is present only on backends with CAS support.
    async fn get(&self, key: &str) -> Result<Option<CachedValue>>;

    /// Unconditional create-or-overwrite
    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool>;

    /// Overwrite only if the entry still carries `token`. Fails without error
    /// when the entry changed or disappeared.
    async fn cas(&self, token: CasToken, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        let _ = (token, key, value, expiry);
        Err(Error::Unsupported(
            "compare-and-swap is not available on this backend".to_string(),
        ))
    }

    /// Delete an entry. `true` when it is gone, including when it never existed.
    /// `delay` is a hint for backends with deferred deletion.
    async fn delete(&self, key: &str, delay: u64) -> Result<bool>;

    /// Create only if the key holds no value.
    ///
    /// The default is a read followed by a write: two callers can both win if
    /// they race between the two steps. Backends with an atomic create
    /// override this.
    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        if self.get(key).await?.is_none() {
            return self.set(key, value, expiry).await;
        }
        Ok(false)
    }

    /// Overwrite only if the key already holds a value
    async fn replace(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return self.set(key, value, expiry).await;
        }
        Ok(false)
    }

    /// Fetch several keys, omitting the ones that are absent
    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key).await? {
                found.insert((*key).to_string(), entry.value);
            }
        }
        Ok(found)
    }

    /// Whether `get` hands out CAS tokens and `cas` is implemented
    fn supports_cas(&self) -> bool {
        false
    }

    /// Remove every entry whose absolute expiry is before `before`.
    /// Returns `false` when the backend does not implement purging.
    async fn delete_objects_expiring_before(
        &self,
        before: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<bool> {
        let _ = (before, progress);
        Ok(false)
    }
}
