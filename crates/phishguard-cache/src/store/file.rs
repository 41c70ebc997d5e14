//! Directory-backed entry store: one pretty-printed JSON file per record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::EntryStore;
use crate::error::CacheError;
use crate::key::StorageKey;
use crate::record::{CacheRecord, RecordMeta};

/// Extension of record files.
pub const RECORD_EXTENSION: &str = "json";

/// Extension of in-progress writes.
pub const TEMP_EXTENSION: &str = "tmp";

/// Stores records as `<dir>/<key>.json`.
///
/// Writes go to a hidden temporary file in the same directory and are then
/// renamed over the target, so a concurrent reader sees the old file or the
/// new one.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    temp_seq: AtomicU64,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        tracing::debug!(dir = %dir.display(), "Opened file store");

        Ok(Self {
            dir,
            temp_seq: AtomicU64::new(0),
        })
    }

    /// Path of the record file for `key`.
    pub fn record_path(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXTENSION))
    }

    fn temp_path(&self, key: &StorageKey) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}.{}.{}",
            key,
            std::process::id(),
            seq,
            TEMP_EXTENSION
        ))
    }

    /// Delete temporary files of writes that never completed.
    ///
    /// Only safe while no writer is active.
    pub async fn clear_temp_files(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TEMP_EXTENSION) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "Removed orphaned temp files");
        }
        Ok(removed)
    }

    async fn describe(&self, key: StorageKey, path: &Path) -> io::Result<RecordMeta> {
        let metadata = tokio::fs::metadata(path).await?;
        let size_bytes = metadata.len();
        let bytes = tokio::fs::read(path).await?;

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) => Ok(RecordMeta::from_record(&record, key, size_bytes)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable cache record");
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(RecordMeta {
                    storage_key: key,
                    identity: None,
                    created_at: modified,
                    size_bytes,
                })
            }
        }
    }
}

#[async_trait]
impl EntryStore for FileStore {
    async fn read(&self, key: &StorageKey) -> Result<Option<CacheRecord>, CacheError> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    async fn write(&self, key: &StorageKey, record: &CacheRecord) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let temp = self.temp_path(key);
        let target = self.record_path(key);

        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CacheError::io(temp, e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(CacheError::io(target, e));
        }

        tracing::trace!(key = %key, bytes = bytes.len(), "Record written");
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, CacheError> {
        let path = self.record_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    async fn list_all(&self) -> Result<Vec<RecordMeta>, CacheError> {
        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(StorageKey::parse)
            else {
                continue;
            };

            match self.describe(key, &path).await {
                Ok(meta) => metas.push(meta),
                // Deleted between listing and reading
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }

        Ok(metas)
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{normalize, SubjectKind};

    fn record(subject: &str, content: &str) -> CacheRecord {
        CacheRecord::new(normalize(subject, SubjectKind::Url), subject, content)
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let rec = record("https://example.com/login", "Looks like a credential harvester.");
        let key = rec.storage_key.clone();

        assert!(store.read(&key).await.unwrap().is_none());

        store.write(&key, &rec).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), Some(rec.clone()));
        assert!(store.record_path(&key).exists());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.read(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let first = record("example.com", "first");
        let key = first.storage_key.clone();

        store.write(&key, &first).await.unwrap();
        let second = record("example.com", "second");
        store.write(&key, &second).await.unwrap();

        assert_eq!(store.read(&key).await.unwrap().unwrap().content, "second");
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let key = StorageKey::parse("0123456789abcdef").unwrap();
        std::fs::write(store.record_path(&key), b"{ not json").unwrap();

        assert!(matches!(
            store.read(&key).await,
            Err(CacheError::Corrupt { .. })
        ));

        let metas = store.list_all().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].storage_key, key);
        assert!(metas[0].identity.is_none());
    }

    #[tokio::test]
    async fn test_list_all_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let rec = record("example.org", "content");
        store.write(&rec.storage_key, &rec).await.unwrap();

        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("0123456789abcdef.lock"), b"").unwrap();
        std::fs::write(dir.path().join(".x.1.2.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("bad name.json"), b"{}").unwrap();

        let metas = store.list_all().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].identity.as_ref(), Some(&rec.identity));
        assert_eq!(metas[0].created_at, rec.created_at);
        assert!(metas[0].size_bytes > 0);

        assert_eq!(store.clear_temp_files().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("ai-cache");
        let store = FileStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
