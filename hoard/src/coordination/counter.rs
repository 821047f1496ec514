use crate::coordination::lock::{DistributedLock, LockWait};
use crate::coordination::merge::release_or_complain;
use crate::domain::parse_integer;
use crate::events::CacheEvent;
use crate::ports::CacheStore;
use bytes::Bytes;
use shared::Result;
use tokio::sync::broadcast;
use tracing::debug;

/// Add `delta` to the integer stored at `key` under its lock, clamping at 0.
///
/// Returns the new value, or `None` when the lock could not be taken, the key
/// is absent, the stored value is not a decimal integer, or the write was
/// refused. The new value is written with no expiry: any expiry the key had
/// before is lost.
pub async fn increment(
    store: &dyn CacheStore,
    lock: &DistributedLock,
    key: &str,
    delta: i64,
    lock_timeout: u64,
    wait: &LockWait,
    events: Option<&broadcast::Sender<CacheEvent>>,
) -> Result<Option<u64>> {
    if !lock.acquire(key, lock_timeout, wait).await? {
        return Ok(None);
    }

    let outcome: Result<Option<u64>> = async {
        let Some(current) = store.get(key).await? else {
            debug!("Cannot increment '{}': key is absent", key);
            return Ok(None);
        };
        let Some(n) = parse_integer(&current.value) else {
            debug!("Cannot increment '{}': value is not an integer", key);
            return Ok(None);
        };

        let updated = n.saturating_add(delta).max(0) as u64;
        if store.set(key, Bytes::from(updated.to_string()), 0).await? {
            Ok(Some(updated))
        } else {
            Ok(None)
        }
    }
    .await;

    release_or_complain(lock, key, events).await;
    outcome
}
