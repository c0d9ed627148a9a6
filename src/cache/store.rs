use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// String-keyed, string-valued cache with per-entry expiry.
///
/// Implementations must not panic when the backing service is down; every
/// failure comes back as a [`CacheStoreError`] and callers decide whether it
/// matters (on the read path it never does).
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Backend name used in logs and the health endpoint.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheStoreError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheStoreError>;

    /// Delete every key in `keys`. Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), CacheStoreError>;
}
