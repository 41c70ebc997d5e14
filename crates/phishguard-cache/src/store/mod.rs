//! Durable storage for cache records.
//!
//! The store is authoritative for reads: the in-memory index is derived from
//! it, never the other way around. Stores know nothing about freshness or
//! eviction; they persist whatever they are handed.

use async_trait::async_trait;

use crate::error::CacheError;
use crate::key::StorageKey;
use crate::record::{CacheRecord, RecordMeta};

mod file;
mod memory;

pub use file::{FileStore, RECORD_EXTENSION, TEMP_EXTENSION};
pub use memory::MemoryStore;

/// Storage backend abstraction, one record per key.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Read the record stored under `key`.
    ///
    /// A corrupt record is an error, not `None`; the caller decides whether
    /// that degrades to a miss.
    async fn read(&self, key: &StorageKey) -> Result<Option<CacheRecord>, CacheError>;

    /// Persist `record` under `key`, replacing any previous record.
    ///
    /// Readers observe either the old or the new record, never a partial one.
    async fn write(&self, key: &StorageKey, record: &CacheRecord) -> Result<(), CacheError>;

    /// Remove the record under `key`. Returns whether a record existed.
    async fn delete(&self, key: &StorageKey) -> Result<bool, CacheError>;

    /// Metadata for every stored record, in no particular order.
    async fn list_all(&self) -> Result<Vec<RecordMeta>, CacheError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
