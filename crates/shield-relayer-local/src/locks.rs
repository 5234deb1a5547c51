//! Named mutex registry for per-key serialization.
//!
//! All work for a given channel id or idempotency key runs under the mutex
//! registered for that key; work under distinct keys proceeds in parallel.
//! Waiters queue in FIFO order (tokio mutexes are fair). An entry is purged
//! from the registry only when no holder or waiter references it, so a key
//! that falls idle costs nothing.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<Mutex<()>>,
    /// Holders plus waiters currently interested in this key.
    refs: AtomicUsize,
}

/// Registry of on-demand, refcounted named mutexes.
pub struct MutexRegistry<K>
where
    K: Eq + Hash + Clone,
{
    entries: DashMap<K, Arc<Entry>>,
}

impl<K> Default for MutexRegistry<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MutexRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Acquires the mutex for `key`, waiting FIFO behind current holders.
    pub async fn acquire(&self, key: K) -> KeyedGuard<'_, K> {
        let entry = {
            // Register interest while the map shard is held, so a racing
            // release cannot purge the entry between lookup and refcount.
            let slot = self.entries.entry(key.clone()).or_insert_with(|| {
                Arc::new(Entry {
                    lock: Arc::new(Mutex::new(())),
                    refs: AtomicUsize::new(0),
                })
            });
            slot.refs.fetch_add(1, Ordering::SeqCst);
            slot.clone()
        };
        let guard = entry.lock.clone().lock_owned().await;
        KeyedGuard {
            registry: self,
            key,
            entry,
            _guard: guard,
        }
    }

    /// Number of live entries; test observability only.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn release(&self, key: &K, entry: &Arc<Entry>) {
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last reference gone; drop the entry unless a newcomer raced in.
            self.entries
                .remove_if(key, |_, e| e.refs.load(Ordering::SeqCst) == 0);
        }
    }
}

/// Holds the named mutex until dropped.
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    registry: &'a MutexRegistry<K>,
    key: K,
    entry: Arc<Entry>,
    _guard: OwnedMutexGuard<()>,
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.registry.release(&self.key, &self.entry);
    }
}
