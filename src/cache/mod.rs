//! Caching for the public storefront read path.
//!
//! The store backends ([`MemoryStore`], [`RedisStore`]) speak plain
//! GET / SET-with-expiry / DEL over string keys and values. Everything typed
//! lives one layer up in [`ReadThroughCache`], which serializes values as JSON
//! and never lets a store failure reach the caller. [`Invalidator`] removes a
//! tenant's keys after a dashboard mutation commits and shares the cache's
//! in-flight load registry, so a load racing the mutation cannot put the old
//! snapshot back.

mod flight;
pub mod invalidate;
pub mod keys;
pub mod memory;
pub mod read_through;
pub mod redis;
pub mod store;

pub use invalidate::Invalidator;
pub use memory::MemoryStore;
pub use read_through::{CacheStats, ReadThroughCache};
pub use redis::RedisStore;
pub use store::{CacheStore, CacheStoreError};
