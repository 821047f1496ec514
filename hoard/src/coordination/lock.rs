use crate::domain::LockExpiryPolicy;
use crate::events::{CacheEvent, LockContendedEvent, LockEvent, publish};
use crate::expiry::now_unix;
use crate::ports::CacheStore;
use bytes::Bytes;
use shared::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Suffix appended to a key to form its lock entry
pub const LOCK_SUFFIX: &str = ":lock";

/// Backoff stops doubling once it exceeds this
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Attempt number from which the backoff starts doubling
const BACKOFF_GROWTH_ATTEMPT: u32 = 3;

pub fn lock_key(key: &str) -> String {
    format!("{}{}", key, LOCK_SUFFIX)
}

/// How long `acquire` may keep retrying a contended lock
#[derive(Clone, Debug, Default)]
pub struct LockWait {
    max_wait: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl LockWait {
    /// Retry until the lock is free, however long that takes
    pub fn forever() -> Self {
        Self::default()
    }

    /// Give up once `max_wait` has elapsed since the first attempt
    pub fn within(max_wait: Duration) -> Self {
        Self {
            max_wait: Some(max_wait),
            cancel: None,
        }
    }

    pub fn from_option(max_wait: Option<Duration>) -> Self {
        Self {
            max_wait,
            cancel: None,
        }
    }

    /// Also give up when `token` is cancelled
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Sleep for `backoff`, clipped to the deadline. Returns false when the
    /// wait is over and no further attempt should be made.
    async fn pause(&self, backoff: Duration, deadline: Option<Instant>) -> bool {
        let backoff = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                backoff.min(deadline - now)
            }
            None => backoff,
        };

        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(backoff) => true,
                }
            }
            None => {
                tokio::time::sleep(backoff).await;
                true
            }
        }
    }
}

/// Advisory mutex built from conditional-create and delete on `"{key}:lock"`.
///
/// Only callers that go through `acquire` are excluded; nothing stops a plain
/// `set` on the protected key. Waiters are not queued, so under sustained
/// contention any of them may win.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    expiry_policy: LockExpiryPolicy,
    event_broadcaster: Option<broadcast::Sender<CacheEvent>>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CacheStore>, expiry_policy: LockExpiryPolicy) -> Self {
        Self {
            store,
            expiry_policy,
            event_broadcaster: None,
        }
    }

    pub fn with_event_broadcaster(
        mut self,
        broadcaster: Option<broadcast::Sender<CacheEvent>>,
    ) -> Self {
        self.event_broadcaster = broadcaster;
        self
    }

    fn publish(&self, event: CacheEvent) {
        publish(self.event_broadcaster.as_ref(), event);
    }

    async fn try_create(&self, lock_key: &str, timeout: u64) -> Result<bool> {
        let expiry = match self.expiry_policy {
            LockExpiryPolicy::BoundToTimeout => timeout,
            LockExpiryPolicy::Unbounded => 0,
        };
        self.store
            .add(lock_key, Bytes::from(timeout.to_string()), expiry)
            .await
    }

    /// Take the lock for `key`.
    ///
    /// Uncontended acquisition costs one round trip and no sleep. On
    /// contention the first backoff is twice the failed attempt's latency,
    /// doubling from the third retry while it is at most [`MAX_BACKOFF`].
    /// Returns `Ok(false)` only when `wait` runs out or is cancelled.
    pub async fn acquire(&self, key: &str, timeout: u64, wait: &LockWait) -> Result<bool> {
        let lock_key = lock_key(key);
        let started = Instant::now();

        if self.try_create(&lock_key, timeout).await? {
            self.publish(CacheEvent::LockAcquired(LockEvent::new(key)));
            return Ok(true);
        }

        let round_trip = started.elapsed();
        let mut backoff = (round_trip * 2).max(Duration::from_micros(1));
        let deadline = wait.max_wait.map(|max_wait| started + max_wait);

        debug!(
            "Lock '{}' is held, backing off from {:?}",
            lock_key, backoff
        );
        self.publish(CacheEvent::LockContended(LockContendedEvent {
            key: key.to_string(),
            initial_backoff_us: backoff.as_micros() as u64,
            timestamp: now_unix(),
        }));

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if attempts >= BACKOFF_GROWTH_ATTEMPT && backoff <= MAX_BACKOFF {
                backoff *= 2;
            }

            if !wait.pause(backoff, deadline).await {
                debug!(
                    "Gave up on lock '{}' after {} retries",
                    lock_key, attempts
                );
                return Ok(false);
            }

            if self.try_create(&lock_key, timeout).await? {
                debug!("Acquired lock '{}' after {} retries", lock_key, attempts);
                self.publish(CacheEvent::LockAcquired(LockEvent::new(key)));
                return Ok(true);
            }
        }
    }

    /// Drop the lock entry. `true` if it is gone, including if it was never there.
    pub async fn release(&self, key: &str) -> Result<bool> {
        let released = self.store.delete(&lock_key(key), 0).await?;
        if released {
            self.publish(CacheEvent::LockReleased(LockEvent::new(key)));
        }
        Ok(released)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("expiry_policy", &self.expiry_policy)
            .finish()
    }
}
