use crate::domain::MergeDecision;
use async_trait::async_trait;
use bytes::Bytes;
use shared::Result;
use std::collections::HashMap;

/// Merge callback: receives the key and its current value (`None` if absent)
pub type MergeCallback<'a> = dyn FnMut(&str, Option<&Bytes>) -> MergeDecision + Send + 'a;

/// Application-level cache operations trait
/// This is what calling code depends on, independent of the backend behind it
#[async_trait]
pub trait CacheOperations: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>>;

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool>;

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool>;

    async fn replace(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically replace the value at `key` with what `callback` derives from it
    async fn merge(
        &self,
        key: &str,
        callback: &mut MergeCallback<'_>,
        expiry: u64,
        attempts: u32,
    ) -> Result<bool>;

    async fn lock(&self, key: &str, timeout: u64) -> Result<bool>;

    async fn unlock(&self, key: &str) -> Result<bool>;

    async fn incr(&self, key: &str, delta: i64) -> Result<Option<u64>>;

    async fn decr(&self, key: &str, delta: i64) -> Result<Option<u64>>;
}
