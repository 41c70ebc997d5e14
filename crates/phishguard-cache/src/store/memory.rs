//! In-memory entry store backed by moka.
//!
//! Nothing survives a restart. Useful for tests and for deployments that
//! only want coalescing and TTL without touching disk. Capacity and TTL are
//! left unset here; freshness and eviction are handled by the cache façade.

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;

use super::EntryStore;
use crate::error::CacheError;
use crate::key::StorageKey;
use crate::record::{CacheRecord, RecordMeta};

/// Entry store held entirely in process memory.
pub struct MemoryStore {
    entries: Cache<StorageKey, Arc<CacheRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().build(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn read(&self, key: &StorageKey) -> Result<Option<CacheRecord>, CacheError> {
        Ok(self.entries.get(key).await.map(|record| (*record).clone()))
    }

    async fn write(&self, key: &StorageKey, record: &CacheRecord) -> Result<(), CacheError> {
        self.entries
            .insert(key.clone(), Arc::new(record.clone()))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).await.is_some())
    }

    async fn list_all(&self) -> Result<Vec<RecordMeta>, CacheError> {
        Ok(self
            .entries
            .iter()
            .map(|(key, record)| {
                RecordMeta::from_record(&record, (*key).clone(), record.approximate_size())
            })
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
