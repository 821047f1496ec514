use bytes::Bytes;
use shared::config::{BackendKind, Config};
use shared::{Error, Result};
use std::time::Duration;

/// Default number of read-compute-CAS cycles attempted by a merge
pub const DEFAULT_MERGE_ATTEMPTS: u32 = 10;

/// Default lock entry timeout in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 60;

/// Longest key accepted by any backend
pub const MAX_KEY_LENGTH: usize = 250;

/// Opaque version marker handed out by a read and consumed by one `cas`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CasToken(pub u64);

/// A value read from a store, together with its CAS token when the backend has one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedValue {
    pub value: Bytes,
    pub cas: Option<CasToken>,
}

impl CachedValue {
    pub fn new(value: Bytes, cas: Option<CasToken>) -> Self {
        Self { value, cas }
    }
}

/// Result of a merge callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeDecision {
    /// Leave the stored value alone; the merge succeeds without writing
    Unchanged,
    /// Store this value
    Replace(Bytes),
}

impl MergeDecision {
    pub fn replace(value: impl Into<Bytes>) -> Self {
        MergeDecision::Replace(value.into())
    }
}

/// Which engine `merge` delegates to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Optimistic CAS when the store supports it, the lock otherwise
    #[default]
    Auto,
    Cas,
    Lock,
}

/// Store-level lifetime given to lock entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockExpiryPolicy {
    /// Lock entries expire after the requested timeout, so a crashed holder
    /// cannot block the key forever
    #[default]
    BoundToTimeout,
    /// Lock entries live until released
    Unbounded,
}

#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub merge_strategy: MergeStrategy,
    /// Optimistic attempts used by [`crate::ObjectCache::merge_with_defaults`]
    pub merge_attempts: u32,
    pub lock_expiry: LockExpiryPolicy,
    pub lock_timeout_secs: u64,
    /// Upper bound on lock acquisition; `None` waits forever
    pub lock_wait: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::Auto,
            merge_attempts: DEFAULT_MERGE_ATTEMPTS,
            lock_expiry: LockExpiryPolicy::BoundToTimeout,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            lock_wait: Some(Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS)),
        }
    }
}

impl CacheOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            merge_strategy: MergeStrategy::Auto,
            merge_attempts: config.merge_attempts,
            lock_expiry: if config.bind_lock_expiry {
                LockExpiryPolicy::BoundToTimeout
            } else {
                LockExpiryPolicy::Unbounded
            },
            lock_timeout_secs: config.lock_timeout_secs,
            lock_wait: match config.lock_wait_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_lock_expiry(mut self, policy: LockExpiryPolicy) -> Self {
        self.lock_expiry = policy;
        self
    }

    pub fn with_lock_wait(mut self, wait: Option<Duration>) -> Self {
        self.lock_wait = wait;
        self
    }
}

/// Backend construction parameters used by storage factories
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub name: String,
    pub backend: BackendKind,
    pub mem_bytes: usize,
    pub max_entries: Option<u64>,
    pub data_dir: Option<String>,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            mem_bytes: 64 * 1024 * 1024,
            max_entries: None,
            data_dir: None,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        Self {
            name: name.into(),
            backend: config.backend,
            mem_bytes: config.mem_bytes,
            max_entries: config.max_entries,
            data_dir: Some(config.data_dir.clone()),
        }
    }
}

/// Reject keys no backend can hold: empty, too long, or containing
/// whitespace/control characters
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidKey(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidKey(format!(
            "key '{}' contains whitespace or control characters",
            key.escape_debug()
        )));
    }
    Ok(())
}

/// True for a non-empty run of ASCII digits that fits in an `i64`
pub fn parse_integer(value: &[u8]) -> Option<i64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse::<i64>().ok()
}
