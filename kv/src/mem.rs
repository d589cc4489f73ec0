//! A process-local [`Client`] implementation.
//!
//! Backs tests and single-node deployments. Values are held decoded; swaps
//! are versioned so the CAS semantics match the external backends exactly.

use std::collections::HashMap;

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{CasFn, Client, Error, PrefixWatchFn, WatchFn, MAX_CAS_RETRIES};

/// Capacity of the change-notification channel shared by all watchers.
///
/// A watcher that lags behind simply re-reads the latest value, so a bounded
/// channel cannot lose committed state, only intermediate observations.
const NOTIFY_BUFFER: usize = 128;

struct Entry<V> {
    value: V,
    version: u64,
}

/// An in-memory KV store with the same observable semantics as the external
/// backends: versioned compare-and-swap and level-triggered watches.
pub struct MemClient<V> {
    state: Mutex<HashMap<String, Entry<V>>>,
    backoff_config: BackoffConfig,
    tx: broadcast::Sender<String>,
}

impl<V> std::fmt::Debug for MemClient<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemClient")
            .field("keys", &self.state.lock().len())
            .finish()
    }
}

impl<V> Default for MemClient<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemClient<V> {
    /// Initialise an empty store.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_BUFFER);
        Self {
            state: Mutex::new(HashMap::new()),
            backoff_config: BackoffConfig {
                init_backoff: std::time::Duration::from_millis(10),
                max_backoff: std::time::Duration::from_millis(100),
                ..Default::default()
            },
            tx,
        }
    }
}

impl<V> MemClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get_versioned(&self, key: &str) -> Option<(V, u64)> {
        self.state
            .lock()
            .get(key)
            .map(|e| (e.value.clone(), e.version))
    }

    /// Store `value` under `key` iff the key's version still matches
    /// `expected_version` (0 = key absent). Returns false if the swap lost
    /// the race.
    fn put_if_version(&self, key: &str, value: V, expected_version: u64) -> bool {
        let mut state = self.state.lock();
        let current_version = state.get(key).map(|e| e.version).unwrap_or(0);
        if current_version != expected_version {
            return false;
        }

        state.insert(
            key.to_string(),
            Entry {
                value,
                version: current_version + 1,
            },
        );
        drop(state);

        // Nobody listening is fine.
        let _ = self.tx.send(key.to_string());
        true
    }
}

#[async_trait]
impl<V> Client<V> for MemClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, Error> {
        Ok(self.get_versioned(key).map(|(v, _)| v))
    }

    async fn cas(&self, key: &str, f: CasFn<'_, V>) -> Result<(), Error> {
        let mut backoff = Backoff::new(&self.backoff_config);

        for attempt in 1..=MAX_CAS_RETRIES {
            let (current, version) = match self.get_versioned(key) {
                Some((v, ver)) => (Some(v), ver),
                None => (None, 0),
            };

            let (new, retry) = match f(current)? {
                (Some(new), retry) => (new, retry),
                (None, _) => return Ok(()),
            };

            if self.put_if_version(key, new, version) {
                return Ok(());
            }
            if !retry {
                return Err(Error::CasExhausted {
                    key: key.to_string(),
                    attempts: attempt,
                });
            }

            debug!(key, attempt, "CAS lost the swap race, retrying");
            if let Some(delay) = backoff.next() {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::CasExhausted {
            key: key.to_string(),
            attempts: MAX_CAS_RETRIES,
        })
    }

    async fn watch_key(&self, key: &str, shutdown: CancellationToken, cb: WatchFn<'_, V>) {
        // Subscribe before the initial read so no update is lost between the
        // two.
        let mut rx = self.tx.subscribe();

        if let Some((value, _)) = self.get_versioned(key) {
            if !cb(value) {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.recv() => {
                    match changed {
                        Ok(changed) if changed == key => {}
                        Ok(_) => continue,
                        // Lagged: skip to the latest value below.
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    }

                    if let Some((value, _)) = self.get_versioned(key) {
                        if !cb(value) {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
        cb: PrefixWatchFn<'_, V>,
    ) {
        let mut rx = self.tx.subscribe();

        let initial: Vec<(String, V)> = {
            let state = self.state.lock();
            state
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect()
        };
        for (key, value) in initial {
            if !cb(&key, value) {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.recv() => {
                    let key = match changed {
                        Ok(key) if key.starts_with(prefix) => key,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    if let Some((value, _)) = self.get_versioned(&key) {
                        if !cb(&key, value) {
                            return;
                        }
                    }
                }
            }
        }
    }
}
