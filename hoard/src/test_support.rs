use crate::domain::{CachedValue, CasToken};
use crate::expiry::{is_expired, now_unix, to_absolute};
use crate::ports::CacheStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use shared::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::Instant;

struct Slot {
    value: Bytes,
    revision: u64,
    expires_at: u64,
}

/// Hash-map store for unit tests, with switches that simulate other writers
/// and failing backends
pub struct HashStore {
    entries: Mutex<HashMap<String, Slot>>,
    next_revision: AtomicU64,
    cas_enabled: bool,
    pub interfere_on_cas: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub fail_sets: AtomicBool,
    pub add_calls: AtomicUsize,
    pub cas_calls: AtomicUsize,
    read_barrier: Option<Arc<Barrier>>,
    barrier_reads_left: AtomicUsize,
    add_latency: Option<Duration>,
    /// Start and end of every `add` call, in call order
    pub add_log: Mutex<Vec<(Instant, Instant)>>,
}

impl HashStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_revision: AtomicU64::new(1),
            cas_enabled: true,
            interfere_on_cas: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_sets: AtomicBool::new(false),
            add_calls: AtomicUsize::new(0),
            cas_calls: AtomicUsize::new(0),
            read_barrier: None,
            barrier_reads_left: AtomicUsize::new(0),
            add_latency: None,
            add_log: Mutex::new(Vec::new()),
        }
    }

    pub fn without_cas() -> Self {
        Self {
            cas_enabled: false,
            ..Self::new()
        }
    }

    /// The first `parties` reads wait for each other before returning, so
    /// concurrent callers all observe the same revision
    pub fn with_read_barrier(mut self, parties: usize) -> Self {
        self.read_barrier = Some(Arc::new(Barrier::new(parties)));
        self.barrier_reads_left = AtomicUsize::new(parties);
        self
    }

    /// Every `add` takes `latency` before touching the map
    pub fn with_add_latency(mut self, latency: Duration) -> Self {
        self.add_latency = Some(latency);
        self
    }

    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().get(key).map(|slot| slot.value.clone())
    }

    pub fn expires_at(&self, key: &str) -> Option<u64> {
        self.entries.lock().get(key).map(|slot| slot.expires_at)
    }

    fn insert_if_absent(&self, key: &str, value: Bytes, expiry: u64) -> bool {
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(key) {
            if !is_expired(slot.expires_at, now_unix()) {
                return false;
            }
        }
        entries.insert(
            key.to_string(),
            Slot {
                value,
                revision,
                expires_at: to_absolute(expiry),
            },
        );
        true
    }

    fn write(&self, key: &str, value: Bytes, expiry: u64) {
        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(
            key.to_string(),
            Slot {
                value,
                revision,
                expires_at: to_absolute(expiry),
            },
        );
    }
}

#[async_trait]
impl CacheStore for HashStore {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>> {
        let found = {
            let entries = self.entries.lock();
            entries
                .get(key)
                .filter(|slot| !is_expired(slot.expires_at, now_unix()))
                .map(|slot| {
                    let cas = self.cas_enabled.then_some(CasToken(slot.revision));
                    CachedValue::new(slot.value.clone(), cas)
                })
        };

        if let Some(barrier) = &self.read_barrier {
            let take = self
                .barrier_reads_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if take {
                barrier.wait().await;
            }
        }

        Ok(found)
    }

    async fn set(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(Error::Storage("set rejected".to_string()));
        }
        self.write(key, value, expiry);
        Ok(true)
    }

    async fn add(&self, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if let Some(latency) = self.add_latency {
            tokio::time::sleep(latency).await;
        }

        let added = self.insert_if_absent(key, value, expiry);
        self.add_log.lock().push((started, Instant::now()));
        Ok(added)
    }

    async fn cas(&self, token: CasToken, key: &str, value: Bytes, expiry: u64) -> Result<bool> {
        if !self.cas_enabled {
            return Err(Error::Unsupported("cas disabled".to_string()));
        }
        self.cas_calls.fetch_add(1, Ordering::SeqCst);

        if self.interfere_on_cas.load(Ordering::SeqCst) {
            let current = self.entries.lock().get(key).map(|slot| slot.value.clone());
            if let Some(current) = current {
                self.write(key, current, 0);
            }
        }

        let revision = self.next_revision.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(slot) if slot.revision == token.0 && !is_expired(slot.expires_at, now_unix()) => {
                slot.value = value;
                slot.revision = revision;
                slot.expires_at = to_absolute(expiry);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str, _delay: u64) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.entries.lock().remove(key);
        Ok(true)
    }

    fn supports_cas(&self) -> bool {
        self.cas_enabled
    }
}
