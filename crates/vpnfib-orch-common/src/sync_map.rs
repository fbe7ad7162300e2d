//! Map wrapper that never creates entries implicitly.
//!
//! Lookups return `Option`, and reference bookkeeping goes through
//! [`SyncMap::add_ref`] / [`SyncMap::release_ref`], which fail on a missing
//! key instead of inserting a default. Entries whose reference set becomes
//! empty are removed and handed back to the caller, so the caller can free
//! whatever the entry owned (a group id, a label) exactly once.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Error type for SyncMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncMapError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Reference not held")]
    NotReferenced,
}

/// Types whose lifetime is governed by a set of named references.
///
/// Adding the same reference twice is a no-op, which keeps repeated
/// installs of one route from inflating the count.
pub trait HasRefCount {
    type Ref;

    /// Adds a reference and returns the new count.
    fn add_ref(&mut self, reference: Self::Ref) -> usize;

    /// Removes a reference and returns the new count, or `None` if the
    /// reference was not held.
    fn remove_ref(&mut self, reference: &Self::Ref) -> Option<usize>;

    fn ref_count(&self) -> usize;
}

/// Result of [`SyncMap::release_ref`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefRelease<V> {
    /// Other references remain.
    Remaining(usize),
    /// The last reference was dropped and the entry removed.
    Last(V),
}

#[derive(Debug, Clone)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Never creates entries.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Never creates entries.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
    V: HasRefCount,
{
    /// Adds a reference to an existing entry.
    pub fn add_ref(&mut self, key: &K, reference: V::Ref) -> Result<usize, SyncMapError> {
        self.inner
            .get_mut(key)
            .map(|entry| entry.add_ref(reference))
            .ok_or(SyncMapError::KeyNotFound)
    }

    /// Drops a reference, removing the entry when none remain.
    pub fn release_ref(
        &mut self,
        key: &K,
        reference: &V::Ref,
    ) -> Result<RefRelease<V>, SyncMapError> {
        let entry = self.inner.get_mut(key).ok_or(SyncMapError::KeyNotFound)?;
        let remaining = entry
            .remove_ref(reference)
            .ok_or(SyncMapError::NotReferenced)?;
        if remaining > 0 {
            return Ok(RefRelease::Remaining(remaining));
        }
        self.inner
            .remove(key)
            .map(RefRelease::Last)
            .ok_or(SyncMapError::KeyNotFound)
    }

    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.inner.get(key).map(HasRefCount::ref_count)
    }
}

impl<K, V> Default for SyncMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Group {
        id: u32,
        users: BTreeSet<String>,
    }

    impl HasRefCount for Group {
        type Ref = String;

        fn add_ref(&mut self, reference: String) -> usize {
            self.users.insert(reference);
            self.users.len()
        }

        fn remove_ref(&mut self, reference: &String) -> Option<usize> {
            self.users.remove(reference).then(|| self.users.len())
        }

        fn ref_count(&self) -> usize {
            self.users.len()
        }
    }

    fn group(id: u32) -> Group {
        Group {
            id,
            users: BTreeSet::new(),
        }
    }

    #[test]
    fn test_missing_key_is_not_created() {
        let mut map: SyncMap<&str, Group> = SyncMap::new();
        assert_eq!(map.add_ref(&"g1", "r1".into()), Err(SyncMapError::KeyNotFound));
        assert!(map.get(&"g1").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_add_ref_is_idempotent() {
        let mut map = SyncMap::new();
        map.insert("g1", group(7));
        assert_eq!(map.add_ref(&"g1", "r1".into()), Ok(1));
        assert_eq!(map.add_ref(&"g1", "r1".into()), Ok(1));
        assert_eq!(map.add_ref(&"g1", "r2".into()), Ok(2));
        assert_eq!(map.ref_count(&"g1"), Some(2));
    }

    #[test]
    fn test_release_last_ref_removes_entry() {
        let mut map = SyncMap::new();
        map.insert("g1", group(7));
        map.add_ref(&"g1", "r1".into()).unwrap();
        map.add_ref(&"g1", "r2".into()).unwrap();

        assert_eq!(
            map.release_ref(&"g1", &"r1".to_string()),
            Ok(RefRelease::Remaining(1))
        );
        match map.release_ref(&"g1", &"r2".to_string()) {
            Ok(RefRelease::Last(released)) => assert_eq!(released.id, 7),
            other => panic!("unexpected release result: {:?}", other),
        }
        assert!(!map.contains_key(&"g1"));
    }

    #[test]
    fn test_release_unknown_ref() {
        let mut map = SyncMap::new();
        map.insert("g1", group(7));
        map.add_ref(&"g1", "r1".into()).unwrap();
        assert_eq!(
            map.release_ref(&"g1", &"other".to_string()),
            Err(SyncMapError::NotReferenced)
        );
        assert_eq!(map.ref_count(&"g1"), Some(1));
    }
}
