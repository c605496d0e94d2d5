//! TTL cache with tag-based invalidation.

mod memory;
mod redis;
mod service;
mod store;
mod tags;

pub use memory::MemoryCacheStore;
pub use self::redis::RedisCacheStore;
pub use service::{compose_key, Cache, CachedValue};
pub use store::{glob_match, CacheStore};
pub use tags::TagIndex;
