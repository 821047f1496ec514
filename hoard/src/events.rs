use crate::expiry::now_unix;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Observable lock and merge activity, published to an optional broadcast
/// channel supplied when the cache is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    LockAcquired(LockEvent),
    LockContended(LockContendedEvent),
    LockReleased(LockEvent),
    LockReleaseFailed(LockEvent),
    MergeCommitted(MergeEvent),
    MergeConflict(MergeEvent),
    MergeExhausted(MergeEvent),
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::LockAcquired(e)
            | CacheEvent::LockReleased(e)
            | CacheEvent::LockReleaseFailed(e) => &e.key,
            CacheEvent::LockContended(e) => &e.key,
            CacheEvent::MergeCommitted(e)
            | CacheEvent::MergeConflict(e)
            | CacheEvent::MergeExhausted(e) => &e.key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::LockAcquired(_) => "lock_acquired",
            CacheEvent::LockContended(_) => "lock_contended",
            CacheEvent::LockReleased(_) => "lock_released",
            CacheEvent::LockReleaseFailed(_) => "lock_release_failed",
            CacheEvent::MergeCommitted(_) => "merge_committed",
            CacheEvent::MergeConflict(_) => "merge_conflict",
            CacheEvent::MergeExhausted(_) => "merge_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub key: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContendedEvent {
    pub key: String,
    /// Initial backoff derived from the failed attempt's round trip
    pub initial_backoff_us: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub key: String,
    pub attempt: u32,
    pub timestamp: u64,
}

impl LockEvent {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            timestamp: now_unix(),
        }
    }
}

impl MergeEvent {
    pub fn new(key: &str, attempt: u32) -> Self {
        Self {
            key: key.to_string(),
            attempt,
            timestamp: now_unix(),
        }
    }
}

/// Publish an event if a broadcaster is configured
pub(crate) fn publish(broadcaster: Option<&broadcast::Sender<CacheEvent>>, event: CacheEvent) {
    let Some(broadcaster) = broadcaster else {
        return;
    };

    match broadcaster.send(event) {
        Ok(subscriber_count) => {
            tracing::trace!("Broadcasted cache event to {} subscriber(s)", subscriber_count);
        }
        Err(broadcast::error::SendError(event)) => {
            tracing::trace!(
                "No subscribers for {} event on key '{}'",
                event.name(),
                event.key()
            );
        }
    }
}
