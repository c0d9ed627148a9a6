use crate::cache::flight::LoadRegistry;
use crate::cache::keys::tenant_keys;
use crate::cache::store::CacheStore;
use std::sync::Arc;

/// Drops a tenant's cached storefront after its data changes.
///
/// Obtained from [`ReadThroughCache::invalidator`](super::ReadThroughCache::invalidator)
/// so it can also detach loads of the tenant that are still in flight.
///
/// Call after the mutation has committed. Store failures are logged and
/// swallowed: a stale entry left behind still expires on its TTL, and the
/// mutating request must succeed either way.
pub struct Invalidator<S: ?Sized = dyn CacheStore> {
    store: Arc<S>,
    loads: Arc<LoadRegistry>,
}

impl<S: CacheStore + ?Sized> Invalidator<S> {
    pub(crate) fn new(store: Arc<S>, loads: Arc<LoadRegistry>) -> Self {
        Self { store, loads }
    }

    pub async fn invalidate(&self, slug: &str) {
        let keys = tenant_keys(slug);
        // Detach in-flight loads before the delete, so a load that finishes
        // after this point either skips its write or removes it again.
        self.loads.invalidate(&keys);
        match self.store.delete(&keys).await {
            Ok(()) => {
                tracing::debug!(slug, keys = keys.len(), "storefront cache invalidated");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    slug,
                    keys = keys.len(),
                    backend = self.store.name(),
                    "cache invalidation failed, entry will expire on TTL"
                );
            }
        }
    }
}
