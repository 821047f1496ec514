pub mod coordination;
pub mod domain;
pub mod events;
pub mod expiry;
pub mod planes;
pub mod ports;

#[cfg(test)]
mod test_support;

pub use coordination::{DistributedLock, LockWait};
pub use domain::{
    CacheOptions, CachedValue, CasToken, LockExpiryPolicy, MergeDecision, MergeStrategy,
};
pub use events::CacheEvent;
pub use planes::data::{CacheOperations, ObjectCache};
pub use ports::{CacheStore, StorageFactory};
