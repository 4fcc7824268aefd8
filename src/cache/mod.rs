//! Cache layer for timestamp records.
//!
//! - **Point entries** hold one record under `entity:<id>`.
//! - **List entries** hold one page of query results under `list:<sha256>`.
//!
//! Entries carry a TTL and may be missing at any time. Mutations reach the
//! cache only through [`CacheInvalidator`].
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! ttl_seconds = 300
//! ```

mod config;
mod invalidation;
mod keys;
pub(crate) mod lock;
mod redis_store;
mod store;
mod timestamps;

pub use config::CacheConfig;
pub use invalidation::{CacheInvalidator, CacheMutation, InvalidationReport};
pub use keys::{CacheKey, LIST_PREFIX, POINT_PREFIX, canonicalize, fingerprint, list_key, point_key};
pub use redis_store::RedisCacheStore;
pub use store::{CacheError, CacheStore, MemoryCacheStore};
pub use timestamps::TimestampCache;
