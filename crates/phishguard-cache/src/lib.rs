//! # phishguard-cache
//!
//! Content-addressed, coalescing cache for generated phishing explanations.
//!
//! Turns an expensive, non-deterministic generation call into a cheap,
//! idempotent, concurrency-safe lookup:
//! - Superficially different subjects (`https://Example.com/`,
//!   `example.com`) share one entry
//! - At most one generation per identity is in flight; concurrent callers
//!   share its result
//! - Records expire after `max_age` and the store is bounded by count and size
//! - Duplicate records left by crashes or older key schemes are collapsed at
//!   startup
//!
//! ## Example
//!
//! ```rust,ignore
//! use phishguard_cache::{CacheConfig, ExplanationCache, SubjectKind};
//!
//! let cache = ExplanationCache::open(CacheConfig::new("data/ai-cache")).await?;
//! let text = cache
//!     .get_or_generate("https://bank-example.com/login", SubjectKind::Url, || async {
//!         provider.explain("https://bank-example.com/login").await
//!     })
//!     .await?;
//! ```

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod evict;
pub mod index;
pub mod key;
pub mod lock;
pub mod reconcile;
pub mod record;
pub mod store;

// Re-export main types at crate root
pub use cache::{CacheStats, ExplanationCache};
pub use coalesce::{RequestCoalescer, Role};
pub use config::{CacheConfig, WriteLockConfig, CACHE_DIR_ENV, CACHE_ENABLED_ENV, CACHE_MAX_AGE_ENV};
pub use error::{CacheError, ConfigError};
pub use evict::{EvictionPlan, EvictionPolicy, EvictionReason};
pub use index::CacheIndex;
pub use key::{normalize, normalize_blob, normalize_blob_bytes, Identity, StorageKey, SubjectKind};
pub use lock::{KeyLocks, LockPolicy, WriteGuard};
pub use reconcile::{reconcile, ReconcileReport};
pub use record::{CacheRecord, RecordMeta};
pub use store::{EntryStore, FileStore, MemoryStore};
