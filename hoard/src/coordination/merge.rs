use crate::coordination::lock::{DistributedLock, LockWait};
use crate::domain::MergeDecision;
use crate::events::{CacheEvent, LockEvent, MergeEvent, publish};
use crate::ports::CacheStore;
use bytes::Bytes;
use shared::{Error, Result};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Read-compute-write cycles without locking. Each lost race (another writer
/// created or changed the key between our read and write) costs one attempt.
/// `attempts` of 0 is treated as 1.
pub async fn merge_via_cas<F>(
    store: &dyn CacheStore,
    key: &str,
    mut callback: F,
    expiry: u64,
    attempts: u32,
    events: Option<&broadcast::Sender<CacheEvent>>,
) -> Result<bool>
where
    F: FnMut(&str, Option<&Bytes>) -> MergeDecision + Send,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let current = store.get(key).await?;
        let decision = callback(key, current.as_ref().map(|c| &c.value));

        let written = match (decision, current) {
            (MergeDecision::Unchanged, _) => return Ok(true),
            // Fails if another writer created the key in the meantime
            (MergeDecision::Replace(value), None) => store.add(key, value, expiry).await?,
            // Fails if another writer changed the key in the meantime
            (MergeDecision::Replace(value), Some(current)) => {
                let token = current.cas.ok_or_else(|| {
                    Error::Unsupported(format!(
                        "store returned no CAS token for '{}'; merge through the lock instead",
                        key
                    ))
                })?;
                store.cas(token, key, value, expiry).await?
            }
        };

        if written {
            publish(events, CacheEvent::MergeCommitted(MergeEvent::new(key, attempt)));
            return Ok(true);
        }

        debug!("Merge of '{}' lost a race on attempt {}/{}", key, attempt, attempts);
        publish(events, CacheEvent::MergeConflict(MergeEvent::new(key, attempt)));
    }

    debug!("Merge of '{}' gave up after {} attempts", key, attempts);
    publish(events, CacheEvent::MergeExhausted(MergeEvent::new(key, attempts)));
    Ok(false)
}

/// Serialise the read-compute-set cycle behind the key's distributed lock.
///
/// The lock is released whatever the cycle's outcome. A failed release does
/// not change the result: the write already happened, but the key stays
/// locked until the entry expires or is removed by hand.
pub async fn merge_via_lock<F>(
    store: &dyn CacheStore,
    lock: &DistributedLock,
    key: &str,
    mut callback: F,
    expiry: u64,
    lock_timeout: u64,
    wait: &LockWait,
    events: Option<&broadcast::Sender<CacheEvent>>,
) -> Result<bool>
where
    F: FnMut(&str, Option<&Bytes>) -> MergeDecision + Send,
{
    if !lock.acquire(key, lock_timeout, wait).await? {
        debug!("Merge of '{}' could not take the lock", key);
        return Ok(false);
    }

    let outcome: Result<bool> = async {
        let current = store.get(key).await?;
        match callback(key, current.as_ref().map(|c| &c.value)) {
            MergeDecision::Unchanged => Ok(true),
            MergeDecision::Replace(value) => store.set(key, value, expiry).await,
        }
    }
    .await;

    release_or_complain(lock, key, events).await;

    if matches!(outcome, Ok(true)) {
        publish(events, CacheEvent::MergeCommitted(MergeEvent::new(key, 1)));
    }
    outcome
}

/// Release a lock taken for a mutation; failure is logged and published, not returned
pub(crate) async fn release_or_complain(
    lock: &DistributedLock,
    key: &str,
    events: Option<&broadcast::Sender<CacheEvent>>,
) {
    let failure = match lock.release(key).await {
        Ok(true) => return,
        Ok(false) => "store refused the delete".to_string(),
        Err(e) => e.to_string(),
    };

    error!(
        "Could not release lock for key '{}' ({}); it stays locked until the entry \
         expires or is removed",
        key,
        failure
    );
    publish(events, CacheEvent::LockReleaseFailed(LockEvent::new(key)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LockExpiryPolicy;
    use crate::test_support::HashStore;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn add_five(_key: &str, current: Option<&Bytes>) -> MergeDecision {
        let n: u64 = current
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        MergeDecision::replace((n + 5).to_string())
    }

    #[tokio::test]
    async fn test_cas_merge_creates_missing_key() {
        let store = HashStore::new();
        assert!(merge_via_cas(&store, "k", add_five, 0, 10, None).await.unwrap());
        assert_eq!(store.raw("k"), Some(Bytes::from("5")));
        assert_eq!(store.add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cas_merge_updates_existing_key() {
        let store = HashStore::new();
        store.set("k", Bytes::from("100"), 0).await.unwrap();

        assert!(merge_via_cas(&store, "k", add_five, 0, 10, None).await.unwrap());
        assert_eq!(store.raw("k"), Some(Bytes::from("105")));
        assert_eq!(store.cas_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_short_circuits_without_writing() {
        let store = HashStore::new();
        let unchanged = |_: &str, _: Option<&Bytes>| MergeDecision::Unchanged;
        let merged = merge_via_cas(&store, "absent", unchanged, 0, 10, None)
            .await
            .unwrap();

        assert!(merged);
        assert!(store.get("absent").await.unwrap().is_none());
        assert_eq!(store.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_attempt_fails_against_winning_writer() {
        let store = HashStore::new();
        store.set("k", Bytes::from("1"), 0).await.unwrap();
        store.interfere_on_cas.store(true, Ordering::SeqCst);

        let (tx, mut rx) = broadcast::channel(8);
        assert!(!merge_via_cas(&store, "k", add_five, 0, 1, Some(&tx)).await.unwrap());
        assert_eq!(store.raw("k"), Some(Bytes::from("1")));

        assert!(matches!(rx.try_recv().unwrap(), CacheEvent::MergeConflict(_)));
        assert!(matches!(rx.try_recv().unwrap(), CacheEvent::MergeExhausted(_)));
    }

    #[tokio::test]
    async fn test_exhausts_every_attempt() {
        let store = HashStore::new();
        store.set("k", Bytes::from("1"), 0).await.unwrap();
        store.interfere_on_cas.store(true, Ordering::SeqCst);

        assert!(!merge_via_cas(&store, "k", add_five, 0, 4, None).await.unwrap());
        assert_eq!(store.cas_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let store = HashStore::new();
        assert!(merge_via_cas(&store, "k", add_five, 0, 0, None).await.unwrap());
        assert_eq!(store.raw("k"), Some(Bytes::from("5")));
    }

    #[tokio::test]
    async fn test_cas_merge_without_token_is_unsupported() {
        let store = HashStore::without_cas();
        store.set("k", Bytes::from("1"), 0).await.unwrap();

        let result = merge_via_cas(&store, "k", add_five, 0, 3, None).await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_cas_merges_retry_and_apply_both() {
        let store = Arc::new(HashStore::new().with_read_barrier(2));
        store.set("balance", Bytes::from("100"), 0).await.unwrap();
        let (tx, mut rx) = broadcast::channel(32);

        let spawn_merge = |store: Arc<HashStore>, tx: broadcast::Sender<CacheEvent>| {
            tokio::spawn(async move {
                merge_via_cas(store.as_ref(), "balance", add_five, 0, 10, Some(&tx)).await
            })
        };
        let first = spawn_merge(store.clone(), tx.clone());
        let second = spawn_merge(store.clone(), tx.clone());

        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        assert_eq!(store.raw("balance"), Some(Bytes::from("110")));

        let mut conflicts = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CacheEvent::MergeConflict(_)) {
                conflicts += 1;
            }
        }
        assert!(conflicts >= 1, "expected at least one CAS conflict");
    }

    #[tokio::test]
    async fn test_lock_merge_writes_and_releases() {
        let store = Arc::new(HashStore::without_cas());
        let lock = DistributedLock::new(store.clone(), LockExpiryPolicy::Unbounded);
        store.set("k", Bytes::from("10"), 0).await.unwrap();

        let wait = LockWait::forever();
        let merged = merge_via_lock(store.as_ref(), &lock, "k", add_five, 0, 60, &wait, None)
            .await
            .unwrap();

        assert!(merged);
        assert_eq!(store.raw("k"), Some(Bytes::from("15")));
        assert!(store.raw("k:lock").is_none());
    }

    #[tokio::test]
    async fn test_lock_merge_unchanged_leaves_key_absent() {
        let store = Arc::new(HashStore::without_cas());
        let lock = DistributedLock::new(store.clone(), LockExpiryPolicy::Unbounded);

        let merged = merge_via_lock(
            store.as_ref(),
            &lock,
            "k",
            |_: &str, _: Option<&Bytes>| MergeDecision::Unchanged,
            0,
            60,
            &LockWait::forever(),
            None,
        )
        .await
        .unwrap();

        assert!(merged);
        assert!(store.raw("k").is_none());
    }

    #[tokio::test]
    async fn test_lock_merge_releases_after_store_error() {
        let store = Arc::new(HashStore::without_cas());
        let lock = DistributedLock::new(store.clone(), LockExpiryPolicy::Unbounded);
        store.fail_sets.store(true, Ordering::SeqCst);

        let wait = LockWait::forever();
        let result = merge_via_lock(store.as_ref(), &lock, "k", add_five, 0, 60, &wait, None).await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(store.raw("k:lock").is_none());
    }

    #[tokio::test]
    async fn test_lock_merge_reports_stuck_lock_without_failing() {
        let store = Arc::new(HashStore::without_cas());
        let lock = DistributedLock::new(store.clone(), LockExpiryPolicy::Unbounded);
        store.fail_deletes.store(true, Ordering::SeqCst);
        let (tx, mut rx) = broadcast::channel(8);

        let wait = LockWait::forever();
        let merged = merge_via_lock(store.as_ref(), &lock, "k", add_five, 0, 60, &wait, Some(&tx))
            .await
            .unwrap();

        assert!(merged);
        assert_eq!(store.raw("k"), Some(Bytes::from("5")));
        assert!(store.raw("k:lock").is_some());

        let saw_release_failure = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|event| matches!(event, CacheEvent::LockReleaseFailed(_)));
        assert!(saw_release_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_merge_fails_when_lock_is_held() {
        let store = Arc::new(HashStore::without_cas());
        let lock = DistributedLock::new(store.clone(), LockExpiryPolicy::Unbounded);
        assert!(lock.acquire("k", 60, &LockWait::forever()).await.unwrap());

        let merged = merge_via_lock(
            store.as_ref(),
            &lock,
            "k",
            add_five,
            0,
            60,
            &LockWait::within(std::time::Duration::from_millis(50)),
            None,
        )
        .await
        .unwrap();

        assert!(!merged);
        assert!(store.raw("k").is_none());
    }
}
