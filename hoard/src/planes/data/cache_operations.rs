use crate::coordination::{self, DistributedLock, LockWait};
use crate::domain::{CacheOptions, CachedValue, MergeDecision, MergeStrategy, validate_key};
use crate::events::CacheEvent;
use crate::planes::data::operation::{CacheOperations, MergeCallback};
use crate::ports::{CacheStore, ProgressFn};
use async_trait::async_trait;
use bytes::Bytes;
use shared::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Application service over a single backend.
///
/// Adds merge, locking and counters on top of the store's raw primitives.
/// Holds no cached state of its own; every call starts from the store.
#[derive(Clone)]
pub struct ObjectCache {
    store: Arc<dyn CacheStore>,
    lock: DistributedLock,
    options: CacheOptions,
    event_broadcaster: Option<broadcast::Sender<CacheEvent>>,
}

impl ObjectCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_options(store, CacheOptions::default())
    }

    pub fn with_options(store: Arc<dyn CacheStore>, options: CacheOptions) -> Self {
        Self {
            lock: DistributedLock::new(store.clone(), options.lock_expiry),
            store,
            options,
            event_broadcaster: None,
        }
    }

    /// Publish lock and merge activity to `broadcaster`
    pub fn with_event_broadcaster(mut self, broadcaster: broadcast::Sender<CacheEvent>) -> Self {
        self.lock = self.lock.with_event_broadcaster(Some(broadcaster.clone()));
        self.event_broadcaster = Some(broadcaster);
        self
    }

    fn events(&self) -> Option<&broadcast::Sender<CacheEvent>> {
        self.event_broadcaster.as_ref()
    }

    fn default_wait(&self) -> LockWait {
        LockWait::from_option(self.options.lock_wait)
    }

    /// Read a value along with its CAS token
    pub async fn get_with_cas(&self, key: &str) -> Result<Option<CachedValue>> {
        validate_key(key)?;
        self.store.get(key).await
    }

    /// Optimistic merge, regardless of the configured strategy
    pub async fn merge_via_cas<F>(
        &self,
        key: &str,
        callback: F,
        expiry: u64,
        attempts: u32,
    ) -> Result<bool>
    where
        F: FnMut(&str, Option<&Bytes>) -> MergeDecision + Send,
    {
        validate_key(key)?;
        coordination::merge_via_cas(
            self.store.as_ref(),
            key,
            callback,
            expiry,
            attempts,
            self.events(),
        )
        .await
    }

    /// Lock-based merge, regardless of the configured strategy
    pub async fn merge_via_lock<F>(&self, key: &str, callback: F, expiry: u64) -> Result<bool>
    where
        F: FnMut(&str, Option<&Bytes>) -> MergeDecision + Send,
    {
        validate_key(key)?;
        coordination::merge_via_lock(
            self.store.as_ref(),
            &self.lock,
            key,
            callback,
            expiry,
            self.options.lock_timeout_secs,
            &self.default_wait(),
            self.events(),
        )
        .await
    }

    /// `merge` with the configured number of optimistic attempts
    pub async fn merge_with_defaults<F>(
        &self,
        key: &str,
        mut callback: F,
        expiry: u64,
    ) -> Result<bool>
    where
        F: FnMut(&str, Option<&Bytes>) -> MergeDecision + Send,
    {
        self.merge(key, &mut callback, expiry, self.options.merge_attempts)
            .await
    }

    /// Whether `merge` goes through compare-and-swap for this store
    pub fn merges_via_cas(&self) -> bool {
        match self.options.merge_strategy {
            MergeStrategy::Auto => self.store.supports_cas(),
            MergeStrategy::Cas => true,
            MergeStrategy::Lock => false,
        }
    }

    /// Take the lock with an explicit wait policy
    pub async fn lock_with(&self, key: &str, timeout: u64, wait: &LockWait) -> Result<bool> {
        validate_key(key)?;
        self.lock.acquire(key, timeout, wait).await
    }

    /// Purge entries expiring before the absolute time `before`.
    /// `false` when the backend cannot purge.
    pub async fn delete_objects_expiring_before(
        &self,
        before: u64,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<bool> {
        self.store.delete_objects_expiring_before(before, progress).await
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("options", &self.options)
            .field("supports_cas", &self.store.supports_cas())
            .finish()
    }
}

#[async_trait]
impl CacheOperations for ObjectCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_with_cas(key).await?.map(|entry| entry.value))
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        for key in keys {
            validate_key(key)?;
        }
        self.store.get_multi(keys).await
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        validate_key(key)?;
        self.store.set(key, value, expiry).await
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        validate_key(key)?;
        self.store.add(key, value, expiry).await
    }

    async fn replace(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        validate_key(key)?;
        self.store.replace(key, value, expiry).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.store.delete(key, 0).await
    }

    async fn merge(
        &self,
        key: &str,
        callback: &mut MergeCallback<'_>,
        expiry: u64,
        attempts: u32,
    ) -> Result<bool> {
        if self.merges_via_cas() {
            self.merge_via_cas(key, callback, expiry, attempts).await
        } else {
            tracing::debug!("Store has no CAS, merging '{}' under its lock", key);
            self.merge_via_lock(key, callback, expiry).await
        }
    }

    async fn lock(&self, key: &str, timeout: u64) -> Result<bool> {
        self.lock_with(key, timeout, &self.default_wait()).await
    }

    async fn unlock(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.lock.release(key).await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        validate_key(key)?;
        coordination::increment(
            self.store.as_ref(),
            &self.lock,
            key,
            delta,
            self.options.lock_timeout_secs,
            &self.default_wait(),
            self.events(),
        )
        .await
    }

    async fn decr(&self, key: &str, delta: i64) -> Result<Option<u64>> {
        self.incr(key, delta.saturating_neg()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DEFAULT_MERGE_ATTEMPTS, LockExpiryPolicy};
    use crate::test_support::HashStore;
    use shared::Error;
    use std::time::Duration;

    fn cache_over(store: &Arc<HashStore>) -> ObjectCache {
        ObjectCache::with_options(
            store.clone(),
            CacheOptions::default().with_lock_expiry(LockExpiryPolicy::Unbounded),
        )
    }

    fn append(suffix: &'static str) -> impl FnMut(&str, Option<&Bytes>) -> MergeDecision + Send {
        move |_key: &str, current: Option<&Bytes>| {
            let mut next = current.map(|v| v.to_vec()).unwrap_or_default();
            next.extend_from_slice(suffix.as_bytes());
            MergeDecision::Replace(Bytes::from(next))
        }
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.set("k", Bytes::from("v"), 0).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert!(cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_stored_false_like_values_are_not_absent() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        cache.set("empty", Bytes::new(), 0).await.unwrap();
        cache.set("zero", Bytes::from("0"), 0).await.unwrap();

        assert_eq!(cache.get("empty").await.unwrap(), Some(Bytes::new()));
        assert_eq!(cache.get("zero").await.unwrap(), Some(Bytes::from("0")));
        assert!(!cache.add("empty", Bytes::from("x"), 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_and_replace() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        assert!(!cache.replace("k", Bytes::from("a"), 0).await.unwrap());
        assert!(cache.add("k", Bytes::from("a"), 0).await.unwrap());
        assert!(!cache.add("k", Bytes::from("b"), 0).await.unwrap());
        assert!(cache.replace("k", Bytes::from("c"), 0).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("c")));
    }

    #[tokio::test]
    async fn test_get_multi_omits_absent_keys() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);
        cache.set("a", Bytes::from("1"), 0).await.unwrap();
        cache.set("c", Bytes::from("3"), 0).await.unwrap();

        let found = cache.get_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], Bytes::from("1"));
        assert_eq!(found["c"], Bytes::from("3"));
    }

    #[tokio::test]
    async fn test_malformed_keys_are_rejected() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        assert!(matches!(
            cache.set("has space", Bytes::from("v"), 0).await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(cache.get("").await, Err(Error::InvalidKey(_))));
        assert!(matches!(cache.lock("bad\nkey", 60).await, Err(Error::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_merge_uses_cas_when_supported() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        let mut callback = append("x");
        assert!(cache.merge("k", &mut callback, 0, DEFAULT_MERGE_ATTEMPTS).await.unwrap());
        assert!(cache.merge("k", &mut callback, 0, DEFAULT_MERGE_ATTEMPTS).await.unwrap());

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("xx")));
        assert_eq!(store.cas_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge_falls_back_to_lock_without_cas() {
        let store = Arc::new(HashStore::without_cas());
        let cache = cache_over(&store);
        assert!(!cache.merges_via_cas());

        cache.set("k", Bytes::from("a"), 0).await.unwrap();
        let mut callback = append("b");
        assert!(cache.merge("k", &mut callback, 0, DEFAULT_MERGE_ATTEMPTS).await.unwrap());

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("ab")));
        assert!(store.raw("k:lock").is_none());
    }

    #[tokio::test]
    async fn test_merge_with_defaults_uses_configured_attempts() {
        let store = Arc::new(HashStore::new());
        store.set("k", Bytes::from("a"), 0).await.unwrap();
        store.interfere_on_cas.store(true, std::sync::atomic::Ordering::SeqCst);

        let mut options = CacheOptions::default();
        options.merge_attempts = 3;
        let cache = ObjectCache::with_options(store.clone(), options);

        assert!(!cache.merge_with_defaults("k", append("b"), 0).await.unwrap());
        assert_eq!(store.cas_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forced_lock_strategy() {
        let store = Arc::new(HashStore::new());
        let cache = ObjectCache::with_options(
            store.clone(),
            CacheOptions::default().with_merge_strategy(MergeStrategy::Lock),
        );

        let mut callback = append("z");
        assert!(cache.merge("k", &mut callback, 0, 1).await.unwrap());
        assert_eq!(store.cas_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("z")));
    }

    #[tokio::test]
    async fn test_merge_no_op_on_absent_key() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        let mut callback = |_: &str, _: Option<&Bytes>| MergeDecision::Unchanged;
        assert!(cache.merge("ghost", &mut callback, 0, 10).await.unwrap());
        assert_eq!(cache.get("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);

        assert!(cache.lock("k", 60).await.unwrap());
        assert!(
            !cache
                .lock_with("k", 60, &LockWait::within(Duration::from_millis(10)))
                .await
                .unwrap()
        );
        assert!(cache.unlock("k").await.unwrap());
        assert!(cache.lock("k", 60).await.unwrap());
        assert!(cache.unlock("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_and_decr() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);
        cache.set("counter", Bytes::from("10"), 0).await.unwrap();

        assert_eq!(cache.incr("counter", 5).await.unwrap(), Some(15));
        assert_eq!(cache.decr("counter", 3).await.unwrap(), Some(12));
        assert_eq!(cache.decr("counter", 100).await.unwrap(), Some(0));
        assert_eq!(cache.incr("missing", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_unsupported_by_default() {
        let store = Arc::new(HashStore::new());
        let cache = cache_over(&store);
        assert!(!cache.delete_objects_expiring_before(u64::MAX, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_events_flow_through_the_cache() {
        let store = Arc::new(HashStore::new());
        let (tx, mut rx) = broadcast::channel(16);
        let cache = cache_over(&store).with_event_broadcaster(tx);

        cache.lock("k", 60).await.unwrap();
        let mut callback = append("e");
        cache.merge("m", &mut callback, 0, 10).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), CacheEvent::LockAcquired(_)));
        assert!(matches!(rx.try_recv().unwrap(), CacheEvent::MergeCommitted(_)));
    }
}
