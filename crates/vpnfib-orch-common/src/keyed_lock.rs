//! Per-key async mutual exclusion.
//!
//! [`KeyedLocks`] hands out one async mutex per key on demand. An entry is
//! dropped from the map when the last guard for it is released and nobody
//! is waiting, so the map only holds keys that are in use.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

pub struct KeyedLocks<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot>>,
}

impl<K> Clone for KeyedLocks<K>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = self.slot(&key);
        let guard = slot.clone().lock_owned().await;
        KeyedGuard {
            key,
            slot,
            guard: Some(guard),
            slots: self.slots.clone(),
        }
    }

    /// Like [`KeyedLocks::lock`] but gives up after `timeout`.
    pub async fn lock_timeout(&self, key: K, timeout: Duration) -> Option<KeyedGuard<K>> {
        let slot = self.slot(&key);
        let guard = tokio::time::timeout(timeout, slot.clone().lock_owned())
            .await
            .ok()?;
        Some(KeyedGuard {
            key,
            slot,
            guard: Some(guard),
            slots: self.slots.clone(),
        })
    }

    /// Keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: &K) -> Slot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Holds the lock for one key until dropped.
pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<DashMap<K, Slot>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.guard.take();
        // One reference is held by the map and one by this guard; anything
        // more means another task is waiting on the slot.
        self.slots.remove_if(&self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2
        });
    }
}
