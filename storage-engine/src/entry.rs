use bytes::Bytes;
use hoard::domain::{CachedValue, CasToken};
use hoard::expiry::{is_expired, now_unix, to_absolute, to_relative};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What every backend keeps per key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Bytes,
    pub revision: u64,
    /// Absolute unix time, 0 for never
    pub expires_at: u64,
}

impl StoredEntry {
    /// Build an entry, normalising a relative `expiry` to an absolute time
    pub fn new(value: Bytes, revision: u64, expiry: u64) -> Self {
        Self {
            value,
            revision,
            expires_at: to_absolute(expiry),
        }
    }

    pub fn is_expired(&self) -> bool {
        is_expired(self.expires_at, now_unix())
    }

    /// Remaining lifetime for eviction policies, `None` for entries that never expire
    pub fn time_to_live(&self) -> Option<Duration> {
        match self.expires_at {
            0 => None,
            expires_at => Some(Duration::from_secs(to_relative(expires_at))),
        }
    }

    pub fn to_cached(&self, with_cas: bool) -> CachedValue {
        CachedValue::new(self.value.clone(), with_cas.then_some(CasToken(self.revision)))
    }
}
