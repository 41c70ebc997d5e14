//! Persisted cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::key::{Identity, StorageKey};

/// One cached explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Key the record was written under
    pub storage_key: StorageKey,

    /// Normalized identity of the subject
    pub identity: Identity,

    /// Subject as the caller presented it
    pub original_subject: String,

    /// Generated explanation text
    pub content: String,

    /// When the explanation was generated
    pub created_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Build a record for freshly generated content.
    pub fn new(
        identity: Identity,
        original_subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            storage_key: identity.storage_key(),
            identity,
            original_subject: original_subject.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Override the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Age of the record relative to `now`. Records from the future are age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Whether the record may still be served as a hit.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) <= max_age
    }

    /// Serialized size estimate used by stores without a physical size.
    pub fn approximate_size(&self) -> u64 {
        (self.identity.as_str().len()
            + self.original_subject.len()
            + self.content.len()
            + self.storage_key.as_str().len()) as u64
    }
}

/// Listing entry returned by [`EntryStore::list_all`](crate::EntryStore::list_all).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMeta {
    /// Key the record is stored under
    pub storage_key: StorageKey,

    /// Stored identity; `None` when the record could not be decoded
    pub identity: Option<Identity>,

    /// Creation time, or the last modification time for unreadable records
    pub created_at: DateTime<Utc>,

    /// Bytes occupied by the record
    pub size_bytes: u64,
}

impl RecordMeta {
    pub(crate) fn from_record(record: &CacheRecord, storage_key: StorageKey, size_bytes: u64) -> Self {
        Self {
            storage_key,
            identity: Some(record.identity.clone()),
            created_at: record.created_at,
            size_bytes,
        }
    }
}
