//! Bookkeeping for loads that are running against the database right now.
//!
//! Shared by [`ReadThroughCache`](super::ReadThroughCache) and the
//! [`Invalidator`](super::Invalidator) it hands out. Each key with pending
//! loads carries an epoch; invalidating the key bumps the epoch and detaches
//! the current single-flight leader, so later reads start a fresh load and the
//! superseded load does not write its snapshot back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Outcome published by the leader of a coalesced load. `None` while the load
/// is running; `Some(None)` when the leader produced nothing followers can use.
pub(crate) type FlightOutcome = Option<Option<String>>;

struct KeyLoads {
    pending: usize,
    epoch: u64,
    leader: Option<watch::Receiver<FlightOutcome>>,
}

#[derive(Default)]
pub(crate) struct LoadRegistry {
    keys: Mutex<HashMap<String, KeyLoads>>,
}

pub(crate) enum Flight<'a> {
    /// Run the loader. Leads a flight when single-flight is on.
    Load(LoadTicket<'a>),
    /// Wait for the current leader of this key.
    Follow(watch::Receiver<FlightOutcome>),
}

impl LoadRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyLoads>> {
        match self.keys.lock() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Join the current leader of `key`, or register a new load (leading it
    /// when `single_flight` is on).
    pub(crate) fn begin(&self, key: &str, single_flight: bool) -> Flight<'_> {
        let mut keys = self.lock();
        if single_flight {
            if let Some(rx) = keys.get(key).and_then(|entry| entry.leader.as_ref()) {
                return Flight::Follow(rx.clone());
            }
        }
        Flight::Load(self.register(&mut keys, key, single_flight))
    }

    /// Register a load that never leads, for a follower whose leader came up
    /// empty.
    pub(crate) fn begin_solo(&self, key: &str) -> LoadTicket<'_> {
        let mut keys = self.lock();
        self.register(&mut keys, key, false)
    }

    fn register(
        &self,
        keys: &mut HashMap<String, KeyLoads>,
        key: &str,
        lead: bool,
    ) -> LoadTicket<'_> {
        let entry = keys.entry(key.to_string()).or_insert(KeyLoads {
            pending: 0,
            epoch: 0,
            leader: None,
        });
        entry.pending += 1;

        let tx = if lead {
            let (tx, rx) = watch::channel(None);
            entry.leader = Some(rx);
            Some(tx)
        } else {
            None
        };

        LoadTicket {
            registry: self,
            key: key.to_string(),
            epoch: entry.epoch,
            tx,
        }
    }

    /// Mark every pending load of `keys` as stale.
    pub(crate) fn invalidate(&self, keys: &[String]) {
        let mut map = self.lock();
        for key in keys {
            if let Some(entry) = map.get_mut(key) {
                entry.epoch += 1;
                entry.leader = None;
            }
        }
    }
}

/// One registered load. Dropping it unregisters the load and, for a leader
/// that never completed, releases its followers empty-handed.
pub(crate) struct LoadTicket<'a> {
    registry: &'a LoadRegistry,
    key: String,
    epoch: u64,
    tx: Option<watch::Sender<FlightOutcome>>,
}

impl LoadTicket<'_> {
    /// False once the key was invalidated after this load started.
    pub(crate) fn is_current(&self) -> bool {
        self.registry
            .lock()
            .get(&self.key)
            .is_some_and(|entry| entry.epoch == self.epoch)
    }

    /// Hand the serialized value to followers, if this load leads a flight.
    pub(crate) fn complete(mut self, json: Option<String>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(json));
        }
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        let led = match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Some(None));
                true
            }
            None => false,
        };

        let mut keys = self.registry.lock();
        let Some(entry) = keys.get_mut(&self.key) else {
            return;
        };
        entry.pending = entry.pending.saturating_sub(1);
        // an invalidation bumps the epoch and detaches the leader, so a
        // matching epoch means the registered leader is still this one
        if led && entry.epoch == self.epoch {
            entry.leader = None;
        }
        if entry.pending == 0 {
            keys.remove(&self.key);
        }
    }
}

pub(crate) async fn wait_for_leader(mut rx: watch::Receiver<FlightOutcome>) -> Option<String> {
    loop {
        let outcome = rx.borrow_and_update().clone();
        if let Some(outcome) = outcome {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_load_follows_leader() {
        let registry = LoadRegistry::default();
        let leader = registry.begin("k", true);
        assert!(matches!(leader, Flight::Load(_)));
        assert!(matches!(registry.begin("k", true), Flight::Follow(_)));
        drop(leader);
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn test_invalidate_detaches_leader_and_marks_stale() {
        let registry = LoadRegistry::default();
        let Flight::Load(old) = registry.begin("k", true) else {
            panic!("first load must lead");
        };
        registry.invalidate(&["k".to_string()]);
        assert!(!old.is_current());

        let Flight::Load(fresh) = registry.begin("k", true) else {
            panic!("load after invalidation must lead, not follow");
        };
        assert!(fresh.is_current());

        // the old leader finishing must not detach the new one
        drop(old);
        assert!(matches!(registry.begin("k", true), Flight::Follow(_)));
        drop(fresh);
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn test_invalidate_without_pending_loads_is_noop() {
        let registry = LoadRegistry::default();
        registry.invalidate(&["k".to_string()]);
        assert!(registry.lock().is_empty());
    }
}
