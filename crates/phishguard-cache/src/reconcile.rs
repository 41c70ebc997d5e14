//! Startup reconciliation.
//!
//! Scans the store, groups records by their stored identity and keeps only
//! the newest record of each group. Reads never depend on this pass (the
//! store is authoritative); it bounds storage growth and re-establishes the
//! one-identity-one-record invariant after key-scheme changes or write
//! races.
//!
//! Must run before the cache accepts requests: it assumes no concurrent
//! writer.

use std::collections::{BTreeMap, HashMap};

use crate::error::CacheError;
use crate::key::{Identity, StorageKey};
use crate::record::RecordMeta;
use crate::store::EntryStore;

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Records listed by the store
    pub scanned: usize,

    /// Older records deleted because a newer one shares their identity
    pub duplicates_removed: Vec<StorageKey>,

    /// Records deleted because they could not be decoded
    pub unreadable_removed: Vec<StorageKey>,

    /// Survivors moved from a legacy key to their canonical key
    pub migrated: Vec<(StorageKey, StorageKey)>,

    /// Resulting identity → key map
    pub index: HashMap<Identity, StorageKey>,
}

impl ReconcileReport {
    /// Total records removed by the pass.
    pub fn removed(&self) -> usize {
        self.duplicates_removed.len() + self.unreadable_removed.len()
    }
}

/// Run one reconciliation pass over `store`.
///
/// Only the initial listing is fatal. Failures on individual records are
/// logged and leave those records in place.
pub async fn reconcile(store: &dyn EntryStore) -> Result<ReconcileReport, CacheError> {
    let metas = store.list_all().await?;
    let mut report = ReconcileReport {
        scanned: metas.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<Identity, Vec<RecordMeta>> = BTreeMap::new();
    for meta in metas {
        match meta.identity.clone() {
            Some(identity) => groups.entry(identity).or_default().push(meta),
            None => {
                if delete_logged(store, &meta.storage_key).await {
                    report.unreadable_removed.push(meta.storage_key);
                }
            }
        }
    }

    for (identity, mut group) in groups {
        let canonical = identity.storage_key();
        newest_first(&mut group, &canonical);

        let mut records = group.into_iter();
        let Some(survivor) = records.next() else {
            continue;
        };

        let mut final_key = survivor.storage_key.clone();
        if survivor.storage_key != canonical {
            if let Some(migrated_to) = migrate(store, &survivor.storage_key, &canonical).await {
                report
                    .migrated
                    .push((survivor.storage_key.clone(), migrated_to.clone()));
                final_key = migrated_to;
            }
        }

        for older in records {
            if older.storage_key == final_key {
                // Overwritten in place by the migration above.
                report.duplicates_removed.push(older.storage_key);
                continue;
            }
            if delete_logged(store, &older.storage_key).await {
                report.duplicates_removed.push(older.storage_key);
            }
        }

        report.index.insert(identity, final_key);
    }

    tracing::info!(
        store = store.name(),
        scanned = report.scanned,
        kept = report.index.len(),
        duplicates = report.duplicates_removed.len(),
        unreadable = report.unreadable_removed.len(),
        migrated = report.migrated.len(),
        "Cache reconciliation complete"
    );

    Ok(report)
}

/// Newest `created_at` first; on ties the record already at the canonical
/// key wins, then the greatest key.
fn newest_first(group: &mut [RecordMeta], canonical: &StorageKey) {
    group.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| (&b.storage_key == canonical).cmp(&(&a.storage_key == canonical)))
            .then_with(|| b.storage_key.cmp(&a.storage_key))
    });
}

/// Rewrite the record at `from` under `to`, then drop `from`.
async fn migrate(store: &dyn EntryStore, from: &StorageKey, to: &StorageKey) -> Option<StorageKey> {
    let mut record = match store.read(from).await {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(key = %from, error = %e, "Cannot migrate cache record");
            return None;
        }
    };

    record.storage_key = to.clone();
    if let Err(e) = store.write(to, &record).await {
        tracing::warn!(from = %from, to = %to, error = %e, "Cache record migration failed");
        return None;
    }
    delete_logged(store, from).await;
    tracing::debug!(from = %from, to = %to, "Migrated cache record to canonical key");
    Some(to.clone())
}

async fn delete_logged(store: &dyn EntryStore, key: &StorageKey) -> bool {
    match store.delete(key).await {
        Ok(existed) => existed,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to delete cache record during reconciliation");
            false
        }
    }
}
