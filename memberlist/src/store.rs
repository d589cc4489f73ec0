//! The local replica of the gossiped key/value state.

use std::collections::HashMap;

use clock::Time;
use kv::Mergeable;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Capacity of the change-notification channel shared by all watchers. A
/// lagging watcher re-reads the latest value, so bounded capacity cannot
/// lose committed state.
const NOTIFY_BUFFER: usize = 128;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    version: u64,
}

/// The mutexed map behind one gossip KV instance.
///
/// All mutation funnels through CRDT merges, so there is no failure mode to
/// surface from a swap: a local CAS commits by merging its own result, and
/// remote updates merge in whatever order the network delivers them.
pub(crate) struct Store<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    notify: broadcast::Sender<String>,
}

impl<V> std::fmt::Debug for Store<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

impl<V> Default for Store<V> {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            notify,
        }
    }
}

impl<V> Store<V>
where
    V: Mergeable,
{
    /// The current value of `key`, if any.
    pub(crate) fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    /// Subscribe to change notifications (the changed key is delivered).
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }

    /// Every key/value pair currently held - the full state for
    /// anti-entropy sync.
    pub(crate) fn full_state(&self) -> Vec<(String, V)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Merge a remotely received `incoming` into `key`, returning the delta
    /// that changed local state. An empty delta (`None`) means the update
    /// carried nothing new and MUST NOT be re-broadcast.
    pub(crate) fn merge_remote(&self, key: &str, incoming: V) -> Option<V> {
        self.apply(key, incoming, false)
    }

    /// Commit a locally produced `new` value for `key`, returning the delta
    /// to broadcast. Content the local update removed becomes tombstones
    /// (`local_cas` merge semantics).
    pub(crate) fn commit_local(&self, key: &str, new: V) -> Option<V> {
        self.apply(key, new, true)
    }

    fn apply(&self, key: &str, incoming: V, local_cas: bool) -> Option<V> {
        let mut entries = self.entries.lock();

        let delta = if entries.contains_key(key) {
            let entry = entries.get_mut(key).expect("key is present");
            let delta = entry.value.merge(incoming, local_cas);
            if delta.is_some() {
                entry.version += 1;
            }
            delta
        } else {
            entries.insert(
                key.to_string(),
                Entry {
                    value: incoming.clone(),
                    version: 1,
                },
            );
            Some(incoming)
        };
        drop(entries);

        if delta.is_some() {
            let _ = self.notify.send(key.to_string());
        }
        delta
    }

    /// Drop tombstones older than `limit` from every value.
    pub(crate) fn purge_tombstones(&self, limit: Time) {
        for entry in self.entries.lock().values_mut() {
            entry.value.remove_tombstones(limit);
        }
    }
}
