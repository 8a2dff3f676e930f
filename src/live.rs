use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type RegistrationId = Uuid;
pub type ResourceKey = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub key: ResourceKey,
}

struct Registration {
    fingerprint: Arc<str>,
    keys: Vec<ResourceKey>,
    signal: mpsc::UnboundedSender<Invalidation>,
}

#[derive(Clone, Default)]
pub struct LiveQueryStore {
    registrations: Arc<DashMap<RegistrationId, Registration>>,
    key_index: Arc<DashMap<ResourceKey, DashSet<RegistrationId>>>,
}

impl LiveQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        keys: Vec<ResourceKey>,
        fingerprint: impl Into<Arc<str>>,
    ) -> (LiveRegistration, mpsc::UnboundedReceiver<Invalidation>) {
        let id = Uuid::new_v4();
        let (signal, receiver) = mpsc::unbounded_channel();
        let fingerprint = fingerprint.into();

        for key in &keys {
            self.key_index.entry(key.clone()).or_default().insert(id);
        }
        debug!(registration = %id, keys = ?keys, "live query registered");

        self.registrations.insert(
            id,
            Registration {
                fingerprint,
                keys,
                signal,
            },
        );

        let guard = LiveRegistration {
            id,
            store: self.clone(),
        };
        (guard, receiver)
    }

    /// Signals every registration watching `key`; returns how many were signalled.
    pub fn invalidate(&self, key: &str) -> usize {
        let ids: Vec<RegistrationId> = match self.key_index.get(key) {
            Some(ids) => ids.iter().map(|r| *r).collect(),
            None => return 0,
        };

        let key: ResourceKey = Arc::from(key);
        let mut signalled = 0;
        for id in ids {
            let closed = match self.registrations.get(&id) {
                Some(registration) => registration
                    .signal
                    .send(Invalidation { key: key.clone() })
                    .is_err(),
                None => continue,
            };
            if closed {
                debug!(registration = %id, "receiver gone, releasing registration");
                self.release(&id);
            } else {
                signalled += 1;
            }
        }

        debug!(key = %key, signalled, "invalidated");
        signalled
    }

    pub fn release(&self, id: &RegistrationId) -> bool {
        let Some((_, registration)) = self.registrations.remove(id) else {
            return false;
        };

        for key in &registration.keys {
            if let Some(ids) = self.key_index.get(key) {
                ids.remove(id);
                if ids.is_empty() {
                    drop(ids);
                    self.key_index.remove_if(key, |_, v| v.is_empty());
                }
            }
        }

        debug!(registration = %id, fingerprint = %registration.fingerprint, "live query released");
        true
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    #[cfg(test)]
    pub fn watchers(&self, key: &str) -> usize {
        self.key_index.get(key).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn registrations_with_fingerprint(&self, fingerprint: &str) -> usize {
        self.registrations
            .iter()
            .filter(|r| r.value().fingerprint.as_ref() == fingerprint)
            .count()
    }
}

pub struct LiveRegistration {
    id: RegistrationId,
    store: LiveQueryStore,
}

impl LiveRegistration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }
}

impl Drop for LiveRegistration {
    fn drop(&mut self) {
        self.store.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Invalidation, LiveQueryStore, ResourceKey};

    fn keys(names: &[&str]) -> Vec<ResourceKey> {
        names.iter().map(|n| Arc::from(*n)).collect()
    }

    #[test]
    fn invalidation_signals_each_watcher_once() {
        let store = LiveQueryStore::new();
        let (_a, mut rx_a) = store.register(keys(&["Query.greetings"]), "a");
        let (_b, mut rx_b) = store.register(keys(&["Query.greetings", "Query.ping"]), "b");

        assert_eq!(store.invalidate("Query.greetings"), 2);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            Invalidation {
                key: Arc::from("Query.greetings")
            }
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unrelated_keys_signal_nobody() {
        let store = LiveQueryStore::new();
        let (_a, mut rx) = store.register(keys(&["Query.greetings"]), "a");
        assert_eq!(store.invalidate("Query.ping"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn repeated_invalidations_are_all_queued() {
        let store = LiveQueryStore::new();
        let (_a, mut rx) = store.register(keys(&["Query.greetings"]), "a");
        store.invalidate("Query.greetings");
        store.invalidate("Query.greetings");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_guard_releases_registration() {
        let store = LiveQueryStore::new();
        let (guard, _rx) = store.register(keys(&["Query.greetings"]), "a");
        assert_eq!(store.watchers("Query.greetings"), 1);

        drop(guard);
        assert_eq!(store.registration_count(), 0);
        assert_eq!(store.watchers("Query.greetings"), 0);
        assert_eq!(store.invalidate("Query.greetings"), 0);
    }

    #[test]
    fn closed_receiver_is_cleaned_up_on_invalidate() {
        let store = LiveQueryStore::new();
        let (_guard, rx) = store.register(keys(&["Query.greetings"]), "a");
        drop(rx);
        assert_eq!(store.invalidate("Query.greetings"), 0);
        assert_eq!(store.registration_count(), 0);
    }

    #[test]
    fn identical_registrations_are_independent() {
        let store = LiveQueryStore::new();
        let (_a, _rx_a) = store.register(keys(&["Query.greetings"]), "same");
        let (_b, _rx_b) = store.register(keys(&["Query.greetings"]), "same");
        assert_eq!(store.registrations_with_fingerprint("same"), 2);
        assert_eq!(store.invalidate("Query.greetings"), 2);
    }
}
