//! In-memory identity → storage-key index.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::key::{Identity, StorageKey};

/// Map from identity to the key of its single stored record.
///
/// Rebuilt by reconciliation at startup, then maintained by every write and
/// delete the cache performs. The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct CacheIndex {
    entries: RwLock<HashMap<Identity, StorageKey>>,
}

impl CacheIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index, e.g. with a reconciliation result.
    pub fn replace(&self, entries: HashMap<Identity, StorageKey>) {
        *self.entries.write() = entries;
    }

    /// Record that `identity` is stored under `key`.
    pub fn insert(&self, identity: Identity, key: StorageKey) {
        self.entries.write().insert(identity, key);
    }

    /// Key currently mapped for `identity`.
    pub fn get(&self, identity: &Identity) -> Option<StorageKey> {
        self.entries.read().get(identity).cloned()
    }

    /// Drop the mapping for `identity` if it still points at `key`.
    pub fn remove_if(&self, identity: &Identity, key: &StorageKey) -> bool {
        let mut entries = self.entries.write();
        if entries.get(identity) == Some(key) {
            entries.remove(identity);
            true
        } else {
            false
        }
    }

    /// Drop every mapping that points at `key`.
    pub fn remove_key(&self, key: &StorageKey) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, stored| stored != key);
        before - entries.len()
    }

    /// Number of indexed identities.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
