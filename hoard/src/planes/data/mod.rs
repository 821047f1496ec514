pub mod cache_operations;
pub mod operation;

pub use cache_operations::ObjectCache;
pub use operation::CacheOperations;
