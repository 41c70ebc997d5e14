//! Per-key write locks.
//!
//! A writer holds `<cache_dir>/<key>.lock` for the duration of a record
//! write. Lock files are created with `create_new`, so the lock also excludes
//! writers in other processes sharing the directory. Acquisition retries
//! with exponential backoff up to a fixed attempt ceiling; what happens when
//! the ceiling is reached is decided by [`LockPolicy`].

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::WriteLockConfig;
use crate::error::CacheError;
use crate::key::StorageKey;

/// Extension of lock files inside the cache directory.
pub const LOCK_EXTENSION: &str = "lock";

/// Behavior when a write lock cannot be acquired within the attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Fail the request with [`CacheError::LockTimeout`].
    Strict,

    /// Log a warning and write without the lock.
    #[default]
    BestEffort,
}

/// Table of per-key lock files rooted at one directory.
#[derive(Debug, Clone)]
pub struct KeyLocks {
    dir: PathBuf,
    config: WriteLockConfig,
}

impl KeyLocks {
    /// Create a lock table in `dir`. The directory must exist before the
    /// first acquisition.
    pub fn new(dir: impl Into<PathBuf>, config: WriteLockConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    /// Path of the lock file for `key`.
    pub fn lock_path(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, LOCK_EXTENSION))
    }

    /// Acquire the write lock for `key`.
    ///
    /// Under [`LockPolicy::BestEffort`] this only fails on unexpected I/O
    /// errors; a busy lock yields an unlocked guard.
    pub async fn acquire(&self, key: &StorageKey) -> Result<WriteGuard, CacheError> {
        let path = self.lock_path(key);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.min_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1));

        let attempt = || create_lock_file(&path);
        let outcome = attempt
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|e: &io::Error| e.kind() == io::ErrorKind::AlreadyExists)
            .notify(|_, delay| {
                tracing::trace!(key = %key, delay = ?delay, "Write lock busy, backing off");
            })
            .await;

        match outcome {
            Ok(()) => Ok(WriteGuard {
                path: Some(path),
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match self.config.policy {
                LockPolicy::Strict => Err(CacheError::LockTimeout {
                    key: key.to_string(),
                    attempts: self.config.max_attempts,
                }),
                LockPolicy::BestEffort => {
                    tracing::warn!(
                        key = %key,
                        attempts = self.config.max_attempts,
                        "Write lock not acquired, proceeding without it"
                    );
                    Ok(WriteGuard::unlocked())
                }
            },
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Remove lock files left behind by a crashed writer.
    ///
    /// Only safe while no writer is active, i.e. before the cache accepts
    /// requests.
    pub async fn clear_stale(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "Removed stale write locks");
        }
        Ok(removed)
    }
}

async fn create_lock_file(path: &Path) -> io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map(|_| ())
}

/// Held write lock; the lock file is removed on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard {
    path: Option<PathBuf>,
}

impl WriteGuard {
    fn unlocked() -> Self {
        Self { path: None }
    }

    /// Whether the lock is actually held.
    pub fn is_locked(&self) -> bool {
        self.path.is_some()
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to release write lock");
                }
            }
        }
    }
}
