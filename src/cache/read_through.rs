use crate::cache::flight::{wait_for_leader, Flight, LoadRegistry, LoadTicket};
use crate::cache::invalidate::Invalidator;
use crate::cache::store::CacheStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of read-through counters, exposed on `/health`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub store_errors: u64,
    pub coalesced: u64,
    /// Loads whose key was invalidated mid-flight, so the result was not cached.
    pub superseded: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    store_errors: AtomicU64,
    coalesced: AtomicU64,
    superseded: AtomicU64,
}

/// Read-through cache over an injected [`CacheStore`].
///
/// Values are stored as JSON. On a hit the loader is never called. On a miss,
/// or when the store cannot be read, the loader runs and a successful result is
/// written back with the given TTL. Absent values and loader errors pass
/// through untouched and are never cached. Store failures are logged and
/// otherwise ignored.
///
/// With single-flight enabled, concurrent misses for one key inside this
/// process share a single loader call. Misses across processes are not
/// coordinated.
///
/// Invalidate through [`invalidator`](Self::invalidator): it detaches loads
/// already in flight for the tenant, so a read that starts after the
/// invalidation runs its own loader and a load that started before it does
/// not write its result back.
pub struct ReadThroughCache<S: ?Sized = dyn CacheStore> {
    store: Arc<S>,
    single_flight: bool,
    loads: Arc<LoadRegistry>,
    counters: Counters,
}

impl<S: CacheStore + ?Sized> ReadThroughCache<S> {
    pub fn new(store: Arc<S>, single_flight: bool) -> Self {
        Self {
            store,
            single_flight,
            loads: Arc::new(LoadRegistry::default()),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Invalidator sharing this cache's store and in-flight loads.
    pub fn invalidator(&self) -> Invalidator<S> {
        Invalidator::new(self.store.clone(), self.loads.clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fills: self.counters.fills.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
        }
    }

    /// Return the value cached under `key`, or run `loader` and cache its result
    /// for `ttl_secs` seconds.
    pub async fn get_cached_data<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl_secs: u64,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let ttl = ttl_from_secs(key, ttl_secs);

        if let Some(value) = self.lookup::<T>(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let ticket = match self.loads.begin(key, self.single_flight) {
            Flight::Load(ticket) => ticket,
            Flight::Follow(rx) => {
                if let Some(json) = wait_for_leader(rx).await {
                    if let Ok(value) = serde_json::from_str::<T>(&json) {
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key, "joined in-flight load");
                        return Ok(Some(value));
                    }
                }
                self.loads.begin_solo(key)
            }
        };

        let (result, json) = self.load_and_fill(key, loader, ttl, &ticket).await;
        ticket.complete(json);
        result
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    tracing::debug!(key, "cache hit");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(error = %e, key, "corrupt cache entry, treating as miss");
                    if let Err(del_err) = self.store.delete(&[key.to_string()]).await {
                        tracing::warn!(error = %del_err, key, "failed to delete corrupt cache entry");
                    }
                    None
                }
            },
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                None
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    key,
                    backend = self.store.name(),
                    "cache read failed, falling back to loader"
                );
                None
            }
        }
    }

    /// Run the loader and write a successful result back unless the key was
    /// invalidated meanwhile. Also returns the serialized value so a
    /// single-flight leader can hand it to followers.
    async fn load_and_fill<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        ttl: Duration,
        ticket: &LoadTicket<'_>,
    ) -> (Result<Option<T>, E>, Option<String>)
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let value = match loader().await {
            Ok(Some(value)) => value,
            other => return (other, None),
        };

        let json = match serde_json::to_string(&value) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, key, "failed to serialize value, not caching");
                return (Ok(Some(value)), None);
            }
        };

        if !ticket.is_current() {
            self.skip_superseded(key);
            return (Ok(Some(value)), Some(json));
        }

        match self.store.set(key, json.clone(), ttl).await {
            Ok(()) => {
                // An invalidation that landed during the write may have run its
                // delete before our set; take the entry back out.
                if !ticket.is_current() {
                    self.skip_superseded(key);
                    if let Err(e) = self.store.delete(&[key.to_string()]).await {
                        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, key, "failed to drop superseded cache entry");
                    }
                } else {
                    self.counters.fills.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key, ttl_secs = ttl.as_secs(), "cache filled");
                }
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    key,
                    backend = self.store.name(),
                    "cache write failed, serving uncached value"
                );
            }
        }

        (Ok(Some(value)), Some(json))
    }

    fn skip_superseded(&self, key: &str) {
        self.counters.superseded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "key invalidated during load, not caching");
    }
}

fn ttl_from_secs(key: &str, ttl_secs: u64) -> Duration {
    if ttl_secs == 0 {
        tracing::warn!(key, "zero cache TTL requested, using 1s");
        return Duration::from_secs(1);
    }
    Duration::from_secs(ttl_secs)
}
