pub mod error;
pub mod port;

pub use error::CacheError;
pub use port::{CacheKey, CacheLock, CacheMetadata, CacheStore};
