use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Builds or reuses the shared state behind proxied connections, keyed by
/// routing key (for the debugger proxy: the target process id).
///
/// Entries are held weakly, so a key's state lives exactly as long as some
/// connection still holds it.
pub struct ClientManagerRegistry<K, S> {
    entries: Mutex<HashMap<K, Weak<S>>>,
}

impl<K, S> Default for ClientManagerRegistry<K, S> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, S> ClientManagerRegistry<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Weak<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live state for `key`, creating it with `create` if none exists.
    pub fn get_or_create(&self, key: &K, create: impl FnOnce() -> S) -> Arc<S> {
        let mut entries = self.lock();
        entries.retain(|_, state| state.strong_count() > 0);

        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let created = Arc::new(create());
        entries.insert(key.clone(), Arc::downgrade(&created));
        created
    }

    pub fn get(&self, key: &K) -> Option<Arc<S>> {
        self.lock().get(key).and_then(Weak::upgrade)
    }

    /// Keys whose state is still held by at least one connection.
    pub fn live_keys(&self) -> Vec<K> {
        self.lock()
            .iter()
            .filter(|(_, state)| state.strong_count() > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|state| state.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
