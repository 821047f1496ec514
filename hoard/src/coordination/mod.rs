pub mod counter;
pub mod lock;
pub mod merge;

pub use counter::increment;
pub use lock::{DistributedLock, LockWait, LOCK_SUFFIX, MAX_BACKOFF, lock_key};
pub use merge::{merge_via_cas, merge_via_lock};
