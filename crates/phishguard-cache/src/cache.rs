//! The explanation cache façade.
//!
//! Ties together normalization, the entry store, the identity index, the
//! request coalescer, per-key write locks and eviction:
//!
//! ```text
//! subject → identity → storage key → store read (TTL)
//!                                      │ miss
//!                                      ▼
//!                  coalesced task: re-read → compute → locked write
//!                                  → index update → eviction
//! ```

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::coalesce::{RequestCoalescer, Role};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::evict::{EvictionPlan, EvictionPolicy};
use crate::index::CacheIndex;
use crate::key::{normalize, normalize_blob_bytes, Identity, StorageKey, SubjectKind};
use crate::lock::{KeyLocks, WriteGuard};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::record::{CacheRecord, RecordMeta};
use crate::store::{EntryStore, FileStore, MemoryStore};

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Fresh records served without computing
    pub hits: u64,

    /// Lookups that found nothing fresh
    pub misses: u64,

    /// Calls into the generation collaborator
    pub computes: u64,

    /// Misses that attached to a computation already in flight
    pub coalesced_waits: u64,

    /// Records deleted by eviction or expiry purges
    pub evictions: u64,

    /// Failed record writes
    pub write_failures: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computes: AtomicU64,
    coalesced_waits: AtomicU64,
    evictions: AtomicU64,
    write_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Content-addressed, coalescing cache for generated explanations.
///
/// Cheap to clone; clones share all state. Construct with
/// [`ExplanationCache::open`] for the on-disk layout, which reconciles the
/// store before returning.
#[derive(Clone)]
pub struct ExplanationCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn EntryStore>,
    locks: Option<KeyLocks>,
    index: CacheIndex,
    coalescer: RequestCoalescer,
    policy: EvictionPolicy,
    maintenance: AsyncMutex<()>,
    config: CacheConfig,
    stats: StatsCounters,
}

impl ExplanationCache {
    /// Open the directory-backed cache described by `config`.
    ///
    /// Removes temp and lock files left by a crashed process, then reconciles
    /// the store and builds the index.
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let store = FileStore::open(&config.cache_dir).await?;
        store.clear_temp_files().await?;

        let locks = KeyLocks::new(&config.cache_dir, config.write_lock.clone());
        locks.clear_stale().await?;

        Self::with_store(Arc::new(store), Some(locks), config).await
    }

    /// Cache over an in-memory store. Nothing is persisted and no lock files
    /// are used.
    pub async fn in_memory(config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_store(Arc::new(MemoryStore::new()), None, config).await
    }

    /// Cache over an arbitrary store. The store is reconciled before the
    /// cache is returned.
    pub async fn with_store(
        store: Arc<dyn EntryStore>,
        locks: Option<KeyLocks>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let cache = Self {
            inner: Arc::new(Inner {
                store,
                locks,
                index: CacheIndex::new(),
                coalescer: RequestCoalescer::new(),
                policy: EvictionPolicy::from_config(&config),
                maintenance: AsyncMutex::new(()),
                config,
                stats: StatsCounters::default(),
            }),
        };
        cache.reconcile().await?;

        tracing::info!(
            store = cache.inner.store.name(),
            records = cache.index_len(),
            max_age = %humantime::format_duration(cache.inner.config.max_age),
            "Explanation cache ready"
        );
        Ok(cache)
    }

    /// Return the cached explanation for `subject`, or run `compute` to
    /// produce it.
    ///
    /// Concurrent callers for the same identity share one run of `compute`.
    /// A failed `compute` is propagated to every waiter and nothing is
    /// cached. Dropping the returned future does not cancel the computation.
    pub async fn get_or_generate<F, Fut, E>(
        &self,
        subject: &str,
        kind: SubjectKind,
        compute: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.generate_for(normalize(subject, kind), subject.to_string(), compute)
            .await
    }

    /// [`get_or_generate`](Self::get_or_generate) for a blob given as raw
    /// bytes. Only byte-identical blobs share an entry; bytes that are not
    /// UTF-8 are stored lossily as the record's original subject.
    pub async fn get_or_generate_blob<F, Fut, E>(
        &self,
        blob: &[u8],
        compute: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let original_subject = String::from_utf8_lossy(blob).into_owned();
        self.generate_for(normalize_blob_bytes(blob), original_subject, compute)
            .await
    }

    async fn generate_for<F, Fut, E>(
        &self,
        identity: Identity,
        original_subject: String,
        compute: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let key = identity.storage_key();

        if let Some(record) = self.inner.read_fresh(&identity, &key).await {
            StatsCounters::bump(&self.inner.stats.hits);
            tracing::debug!(identity = %identity, key = %key, "Cache hit");
            return Ok(record.content);
        }
        StatsCounters::bump(&self.inner.stats.misses);
        tracing::debug!(identity = %identity, key = %key, "Cache miss");

        let inner = Arc::clone(&self.inner);
        let task_identity = identity.clone();
        let (role, outcome) = self.inner.coalescer.join_or_start(&identity, move || {
            inner.fill(task_identity, key, original_subject, compute)
        });
        if role == Role::Follower {
            StatsCounters::bump(&self.inner.stats.coalesced_waits);
        }

        outcome.await
    }

    /// Fresh record for `subject`, without computing anything.
    pub async fn lookup(&self, subject: &str, kind: SubjectKind) -> Option<CacheRecord> {
        let identity = normalize(subject, kind);
        let key = identity.storage_key();
        self.inner.read_fresh(&identity, &key).await
    }

    /// Delete the record for `subject`. Returns whether one existed.
    pub async fn invalidate(&self, subject: &str, kind: SubjectKind) -> Result<bool, CacheError> {
        let identity = normalize(subject, kind);
        let canonical = identity.storage_key();
        let mut keys = vec![canonical.clone()];
        if let Some(indexed) = self.inner.index.get(&identity) {
            if indexed != canonical {
                keys.push(indexed);
            }
        }

        let mut removed = false;
        for key in keys {
            let _guard = self.inner.lock(&key).await?;
            if self.inner.store.delete(&key).await? {
                removed = true;
            }
            self.inner.index.remove_if(&identity, &key);
        }

        tracing::debug!(identity = %identity, removed, "Invalidated cache entry");
        Ok(removed)
    }

    /// Enforce the count and size bounds now.
    ///
    /// Returns the records actually deleted.
    pub async fn maybe_evict(&self) -> Result<EvictionPlan, CacheError> {
        self.inner.maybe_evict().await
    }

    /// Delete every record older than `max_age`.
    pub async fn purge_expired(&self) -> Result<EvictionPlan, CacheError> {
        self.inner.purge_expired().await
    }

    /// Re-run reconciliation and replace the index with its result.
    ///
    /// Serialized with eviction. Writes racing with the pass may be absent
    /// from the index until their next access.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CacheError> {
        let _running = self.inner.maintenance.lock().await;
        let report = reconcile(self.inner.store.as_ref()).await?;
        self.inner.index.replace(report.index.clone());
        Ok(report)
    }

    /// Listing of every stored record.
    pub async fn entries(&self) -> Result<Vec<RecordMeta>, CacheError> {
        self.inner.store.list_all().await
    }

    /// Start a background task running [`purge_expired`](Self::purge_expired)
    /// and [`maybe_evict`](Self::maybe_evict) every `interval`.
    ///
    /// The task stops on its own once every handle to the cache is dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Cache dropped, stopping maintenance");
                    break;
                };
                if let Err(e) = inner.purge_expired().await {
                    tracing::warn!(error = %e, "Scheduled expiry purge failed");
                }
                if let Err(e) = inner.maybe_evict().await {
                    tracing::warn!(error = %e, "Scheduled eviction failed");
                }
            }
        })
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// Number of identities in the index.
    pub fn index_len(&self) -> usize {
        self.inner.index.len()
    }

    /// Number of computations in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }

    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ExplanationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplanationCache")
            .field("store", &self.inner.store.name())
            .field("indexed", &self.index_len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Inner {
    /// Read `key` and return the record if it is still fresh.
    ///
    /// Read failures are logged and reported as a miss.
    async fn read_fresh(&self, identity: &Identity, key: &StorageKey) -> Option<CacheRecord> {
        let record = match self.store.read(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        if !record.is_fresh(Utc::now(), self.config.max_age) {
            tracing::debug!(
                identity = %identity,
                key = %key,
                created_at = %record.created_at,
                "Cached record expired"
            );
            return None;
        }

        if self.index.get(identity).as_ref() != Some(key) {
            self.index.insert(identity.clone(), key.clone());
        }
        Some(record)
    }

    /// Body of the coalesced task for one identity.
    async fn fill<F, Fut, E>(
        self: Arc<Self>,
        identity: Identity,
        key: StorageKey,
        original_subject: String,
        compute: F,
    ) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        // A previous task may have completed between the caller's read and
        // this task's registration.
        if let Some(record) = self.read_fresh(&identity, &key).await {
            return Ok(record.content);
        }

        StatsCounters::bump(&self.stats.computes);
        let content = compute().await.map_err(|e| {
            tracing::warn!(identity = %identity, error = %e, "Explanation generation failed");
            CacheError::compute(e)
        })?;

        let record = CacheRecord::new(identity.clone(), original_subject, content.clone());
        self.persist(&key, &record).await?;
        self.index.insert(identity.clone(), key.clone());
        tracing::debug!(identity = %identity, key = %key, "Cached new explanation");

        if let Err(e) = self.maybe_evict().await {
            tracing::warn!(error = %e, "Eviction after write failed");
        }
        Ok(content)
    }

    async fn lock(&self, key: &StorageKey) -> Result<Option<WriteGuard>, CacheError> {
        match &self.locks {
            Some(locks) => locks.acquire(key).await.map(Some),
            None => Ok(None),
        }
    }

    async fn persist(&self, key: &StorageKey, record: &CacheRecord) -> Result<(), CacheError> {
        let result = async {
            let _guard = self.lock(key).await?;
            self.store.write(key, record).await
        }
        .await;

        if let Err(e) = &result {
            StatsCounters::bump(&self.stats.write_failures);
            tracing::error!(key = %key, error = %e, "Failed to write cache record");
        }
        result
    }

    async fn maybe_evict(&self) -> Result<EvictionPlan, CacheError> {
        let _running = self.maintenance.lock().await;
        let metas = self.store.list_all().await?;
        let plan = self.policy.plan(&metas);
        Ok(self.execute(plan).await)
    }

    async fn purge_expired(&self) -> Result<EvictionPlan, CacheError> {
        let _running = self.maintenance.lock().await;
        let metas = self.store.list_all().await?;
        let plan = self.policy.plan_expired(&metas, Utc::now());
        Ok(self.execute(plan).await)
    }

    /// Delete the planned victims, dropping each index mapping right after
    /// its record. Victims that fail to delete, or that were rewritten after
    /// the listing, are left out of the returned plan.
    async fn execute(&self, plan: EvictionPlan) -> EvictionPlan {
        let Some(reason) = plan.reason else {
            return plan;
        };

        let mut deleted = Vec::with_capacity(plan.victims.len());
        for victim in plan.victims {
            match self.evict_one(&victim).await {
                Ok(true) => {
                    self.index.remove_key(&victim.storage_key);
                    StatsCounters::bump(&self.stats.evictions);
                    deleted.push(victim);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %victim.storage_key, error = %e, "Failed to evict cache record");
                }
            }
        }

        if !deleted.is_empty() {
            tracing::info!(
                reason = %reason,
                evicted = deleted.len(),
                remaining = self.index.len(),
                "Evicted cache records"
            );
        }

        EvictionPlan {
            reason: Some(reason),
            victims: deleted,
        }
    }

    /// Delete one victim under its write lock, unless the stored record is
    /// no longer the one that was listed.
    async fn evict_one(&self, victim: &RecordMeta) -> Result<bool, CacheError> {
        let _guard = self.lock(&victim.storage_key).await?;

        match self.store.read(&victim.storage_key).await {
            Ok(Some(current)) if current.created_at > victim.created_at => {
                tracing::debug!(
                    key = %victim.storage_key,
                    created_at = %current.created_at,
                    "Record rewritten since listing, not evicting"
                );
                return Ok(false);
            }
            Ok(None) => return Ok(false),
            // Unreadable records are still removed
            Ok(Some(_)) | Err(_) => {}
        }

        self.store.delete(&victim.storage_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockPolicy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;

    type TestError = std::io::Error;

    fn counted(
        calls: &Arc<AtomicUsize>,
        text: &'static str,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<String, TestError>> + Send + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(text.to_string())
            })
        }
    }

    async fn memory_cache() -> ExplanationCache {
        ExplanationCache::in_memory(CacheConfig::default()).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_compute_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExplanationCache::open(CacheConfig::new(dir.path())).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_generate("https://phish.example/verify", SubjectKind::Url, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, TestError>("Credential harvesting page.".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "Credential harvesting page.");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().computes, 1);
        assert_eq!(cache.in_flight(), 0);
        assert_eq!(cache.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hit_does_not_recompute() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_generate("example.com", SubjectKind::Url, counted(&calls, "first"))
            .await
            .unwrap();
        let second = cache
            .get_or_generate("example.com", SubjectKind::Url, counted(&calls, "second"))
            .await
            .unwrap();

        assert_eq!(first, "first");
        assert_eq!(second, "first");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_superficial_variants_share_entry() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));

        for subject in ["https://Example.com/", "example.com", "HTTP://www.example.com"] {
            let text = cache
                .get_or_generate(subject, SubjectKind::Url, counted(&calls, "same"))
                .await
                .unwrap();
            assert_eq!(text, "same");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.index_len(), 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = ExplanationCache::with_store(store.clone(), None, CacheConfig::default())
            .await
            .unwrap();

        let identity = normalize("old.example", SubjectKind::Url);
        let max_age = ChronoDuration::from_std(cache.config().max_age).unwrap();
        let stale = CacheRecord::new(identity.clone(), "old.example", "stale text")
            .with_created_at(Utc::now() - max_age - ChronoDuration::seconds(1));
        store.write(&stale.storage_key, &stale).await.unwrap();

        assert!(cache.lookup("old.example", SubjectKind::Url).await.is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let text = cache
            .get_or_generate("old.example", SubjectKind::Url, counted(&calls, "fresh text"))
            .await
            .unwrap();
        assert_eq!(text, "fresh text");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = store.read(&identity.storage_key()).await.unwrap().unwrap();
        assert_eq!(stored.content, "fresh text");
    }

    #[tokio::test]
    async fn test_count_bound_keeps_most_recent() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let max_records = cache.config().max_records;

        for i in 0..max_records + 10 {
            let subject = format!("site{i}.example");
            cache
                .get_or_generate(&subject, SubjectKind::Url, counted(&calls, "text"))
                .await
                .unwrap();
        }

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), cache.config().records_to_keep);
        assert_eq!(cache.index_len(), cache.config().records_to_keep);
        assert_eq!(cache.stats().evictions, 10);

        for i in 0..10 {
            let subject = format!("site{i}.example");
            assert!(cache.lookup(&subject, SubjectKind::Url).await.is_none());
        }
        for i in 10..max_records + 10 {
            let subject = format!("site{i}.example");
            assert!(cache.lookup(&subject, SubjectKind::Url).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = memory_cache().await;

        let failed = cache
            .get_or_generate("flaky.example", SubjectKind::Url, || async {
                Err::<String, _>(TestError::new(std::io::ErrorKind::TimedOut, "provider timed out"))
            })
            .await;

        let err = failed.unwrap_err();
        assert!(err.is_compute());
        assert!(err.to_string().contains("provider timed out"));
        assert!(cache.entries().await.unwrap().is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let text = cache
            .get_or_generate("flaky.example", SubjectKind::Url, counted(&calls, "recovered"))
            .await
            .unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bank_login_variants_compute_once() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, TestError>("Lookalike bank login page.".to_string())
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_generate("https://bank-example.com/login", SubjectKind::Url, slow(calls.clone())),
            cache.get_or_generate("bank-example.com/login", SubjectKind::Url, slow(calls.clone())),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl EntryStore for ReadOnlyStore {
        async fn read(&self, key: &StorageKey) -> Result<Option<CacheRecord>, CacheError> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &StorageKey, _record: &CacheRecord) -> Result<(), CacheError> {
            Err(CacheError::io(
                format!("/readonly/{key}.json"),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ))
        }

        async fn delete(&self, key: &StorageKey) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn list_all(&self) -> Result<Vec<RecordMeta>, CacheError> {
            self.inner.list_all().await
        }

        fn name(&self) -> &str {
            "read-only"
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced() {
        let store = Arc::new(ReadOnlyStore {
            inner: MemoryStore::new(),
        });
        let cache = ExplanationCache::with_store(store, None, CacheConfig::default())
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .get_or_generate("example.org", SubjectKind::Url, counted(&calls, "text"))
            .await;
        assert!(matches!(result, Err(CacheError::Io { .. })));
        assert_eq!(cache.stats().write_failures, 1);
        assert_eq!(cache.index_len(), 0);

        // Nothing cached, so the next call computes again
        let _ = cache
            .get_or_generate("example.org", SubjectKind::Url, counted(&calls, "text"))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_strict_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.write_lock.policy = LockPolicy::Strict;
        config.write_lock.max_attempts = 2;
        config.write_lock.min_delay = Duration::from_millis(1);
        config.write_lock.max_delay = Duration::from_millis(2);
        let cache = ExplanationCache::open(config).await.unwrap();

        let key = normalize("locked.example", SubjectKind::Url).storage_key();
        std::fs::write(dir.path().join(format!("{key}.lock")), b"").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let result = cache
            .get_or_generate("locked.example", SubjectKind::Url, counted(&calls, "text"))
            .await;
        assert!(matches!(result, Err(CacheError::LockTimeout { attempts: 2, .. })));
        assert_eq!(cache.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn test_open_reconciles_and_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let identity = normalize("kept.example", SubjectKind::Url);
            let older = CacheRecord::new(identity.clone(), "kept.example", "older")
                .with_created_at(Utc::now() - ChronoDuration::minutes(5));
            let mut legacy = older.clone();
            legacy.storage_key = StorageKey::parse("legacy_key").unwrap();
            store.write(&legacy.storage_key, &legacy).await.unwrap();

            let newer = CacheRecord::new(identity, "kept.example", "newer");
            store.write(&newer.storage_key, &newer).await.unwrap();
        }
        std::fs::write(dir.path().join("0123456789abcdef.lock"), b"").unwrap();

        let cache = ExplanationCache::open(CacheConfig::new(dir.path())).await.unwrap();
        assert_eq!(cache.index_len(), 1);
        assert_eq!(cache.entries().await.unwrap().len(), 1);
        assert!(!dir.path().join("0123456789abcdef.lock").exists());

        let record = cache.lookup("kept.example", SubjectKind::Url).await.unwrap();
        assert_eq!(record.content, "newer");
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_generate("example.net", SubjectKind::Url, counted(&calls, "text"))
            .await
            .unwrap();

        assert!(cache.invalidate("https://www.example.net/", SubjectKind::Url).await.unwrap());
        assert!(!cache.invalidate("example.net", SubjectKind::Url).await.unwrap());
        assert_eq!(cache.index_len(), 0);

        cache
            .get_or_generate("example.net", SubjectKind::Url, counted(&calls, "text"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_expired_and_maintenance() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            max_age: Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let cache = ExplanationCache::with_store(store.clone(), None, config)
            .await
            .unwrap();

        let identity = normalize("expired.example", SubjectKind::Url);
        let record = CacheRecord::new(identity, "expired.example", "old")
            .with_created_at(Utc::now() - ChronoDuration::minutes(10));
        store.write(&record.storage_key, &record).await.unwrap();

        let plan = cache.purge_expired().await.unwrap();
        assert_eq!(plan.victims.len(), 1);
        assert!(store.list_all().await.unwrap().is_empty());

        store.write(&record.storage_key, &record).await.unwrap();
        let handle = cache.spawn_maintenance(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.list_all().await.unwrap().is_empty());
        handle.abort();
    }

    /// Memory store that writes a queued record right after the next listing,
    /// as a concurrent refresh would.
    struct RefreshingStore {
        inner: MemoryStore,
        queued: parking_lot::Mutex<Option<CacheRecord>>,
    }

    #[async_trait]
    impl EntryStore for RefreshingStore {
        async fn read(&self, key: &StorageKey) -> Result<Option<CacheRecord>, CacheError> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &StorageKey, record: &CacheRecord) -> Result<(), CacheError> {
            self.inner.write(key, record).await
        }

        async fn delete(&self, key: &StorageKey) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn list_all(&self) -> Result<Vec<RecordMeta>, CacheError> {
            let listed = self.inner.list_all().await?;
            let queued = self.queued.lock().take();
            if let Some(record) = queued {
                self.inner.write(&record.storage_key, &record).await?;
            }
            Ok(listed)
        }

        fn name(&self) -> &str {
            "refreshing"
        }
    }

    #[tokio::test]
    async fn test_eviction_skips_record_rewritten_after_listing() {
        let store = Arc::new(RefreshingStore {
            inner: MemoryStore::new(),
            queued: parking_lot::Mutex::new(None),
        });
        let refreshed = normalize("refreshed.example", SubjectKind::Url);
        let older = normalize("older.example", SubjectKind::Url);
        for (identity, minutes) in [(&refreshed, 10), (&older, 5)] {
            let record = CacheRecord::new(identity.clone(), identity.as_str(), "stale text")
                .with_created_at(Utc::now() - ChronoDuration::minutes(minutes));
            store.write(&record.storage_key, &record).await.unwrap();
        }

        let config = CacheConfig {
            max_records: 2,
            records_to_keep: 1,
            ..CacheConfig::default()
        };
        let cache = ExplanationCache::with_store(store.clone(), None, config)
            .await
            .unwrap();
        *store.queued.lock() = Some(CacheRecord::new(
            refreshed.clone(),
            "refreshed.example",
            "refreshed text",
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_generate("newest.example", SubjectKind::Url, counted(&calls, "newest text"))
            .await
            .unwrap();

        // The listing picked both older records; only the untouched one goes
        let record = cache.lookup("refreshed.example", SubjectKind::Url).await.unwrap();
        assert_eq!(record.content, "refreshed text");
        assert!(cache.lookup("older.example", SubjectKind::Url).await.is_none());
        assert!(cache.lookup("newest.example", SubjectKind::Url).await.is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_non_utf8_blob_is_cached() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let headers = b"From: =?iso-8859-1?Q?B=E4nk?= <a@example.de>\r\nSubject: R\xe9sum\xe9\r\n";

        for _ in 0..2 {
            let text = cache
                .get_or_generate_blob(headers, counted(&calls, "latin-1 headers"))
                .await
                .unwrap();
            assert_eq!(text, "latin-1 headers");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries[0].identity, Some(normalize_blob_bytes(headers)));
    }

    #[tokio::test]
    async fn test_blob_cannot_read_url_entry() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_generate("https://example.com/", SubjectKind::Url, counted(&calls, "url text"))
            .await
            .unwrap();
        let blob = cache
            .get_or_generate("url:example.com", SubjectKind::Blob, counted(&calls, "blob text"))
            .await
            .unwrap();

        assert_eq!(blob, "blob text");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.index_len(), 2);
    }

    #[tokio::test]
    async fn test_blob_subjects() {
        let cache = memory_cache().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let headers = "Received: from mail.example\r\nFrom: \"Bank\" <alerts@bank-examp1e.com>";

        cache
            .get_or_generate(headers, SubjectKind::Blob, counted(&calls, "spoofed sender"))
            .await
            .unwrap();
        let again = cache
            .get_or_generate(headers, SubjectKind::Blob, counted(&calls, "other"))
            .await
            .unwrap();
        assert_eq!(again, "spoofed sender");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Blob identity is byte-exact
        let changed = headers.replace("\r\n", "\n");
        cache
            .get_or_generate(&changed, SubjectKind::Blob, counted(&calls, "other"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
