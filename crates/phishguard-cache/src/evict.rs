//! Count-, size- and age-bounded eviction planning.
//!
//! Planning is pure: it takes a store listing and returns the records to
//! delete. The cache façade performs the deletions and keeps the index in
//! sync.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::record::RecordMeta;

/// Why records were selected for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// More than `max_records` records
    Count,
    /// Total size above the cleanup threshold
    Size,
    /// Older than `max_age`
    Expired,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Count => write!(f, "count"),
            EvictionReason::Size => write!(f, "size"),
            EvictionReason::Expired => write!(f, "expired"),
        }
    }
}

/// Records chosen for deletion, oldest first.
#[derive(Debug, Clone, Default)]
pub struct EvictionPlan {
    /// Bound that triggered the plan; `None` when nothing is due
    pub reason: Option<EvictionReason>,

    /// Records to delete, or after execution the records deleted
    pub victims: Vec<RecordMeta>,
}

impl EvictionPlan {
    /// Whether nothing needs deleting.
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Bounds enforced on the store.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// Record count above which the count bound applies
    pub max_records: usize,

    /// Most recent records that are never evicted for count or size
    pub records_to_keep: usize,

    /// Total size above which the size bound applies
    pub size_trigger_bytes: u64,

    /// Total size the size pass shrinks the store below
    pub size_target_bytes: u64,

    /// Age past which records are purged
    pub max_age: Duration,
}

impl EvictionPolicy {
    /// Derive the policy from a cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_records: config.max_records,
            records_to_keep: config.records_to_keep,
            size_trigger_bytes: config.size_trigger_bytes(),
            size_target_bytes: config.size_target_bytes(),
            max_age: config.max_age,
        }
    }

    /// Select records to delete after a write.
    ///
    /// The count bound is checked first; the size bound only when the count
    /// is within limits. The size pass never touches the `records_to_keep`
    /// most recent records.
    pub fn plan(&self, metas: &[RecordMeta]) -> EvictionPlan {
        let mut ordered = metas.to_vec();
        oldest_first(&mut ordered);

        let count = ordered.len();
        if count > self.max_records {
            let excess = count - self.records_to_keep.min(count);
            ordered.truncate(excess);
            return EvictionPlan {
                reason: Some(EvictionReason::Count),
                victims: ordered,
            };
        }

        let mut total: u64 = ordered.iter().map(|m| m.size_bytes).sum();
        if total <= self.size_trigger_bytes {
            return EvictionPlan::default();
        }

        let evictable = count.saturating_sub(self.records_to_keep);
        let mut victims = Vec::new();
        for meta in ordered.into_iter().take(evictable) {
            if total < self.size_target_bytes {
                break;
            }
            total = total.saturating_sub(meta.size_bytes);
            victims.push(meta);
        }

        EvictionPlan {
            reason: (!victims.is_empty()).then_some(EvictionReason::Size),
            victims,
        }
    }

    /// Select every record older than `max_age` at `now`.
    pub fn plan_expired(&self, metas: &[RecordMeta], now: DateTime<Utc>) -> EvictionPlan {
        let mut victims: Vec<RecordMeta> = metas
            .iter()
            .filter(|m| {
                (now - m.created_at)
                    .to_std()
                    .map(|age| age > self.max_age)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        oldest_first(&mut victims);

        EvictionPlan {
            reason: (!victims.is_empty()).then_some(EvictionReason::Expired),
            victims,
        }
    }
}

fn oldest_first(metas: &mut [RecordMeta]) {
    metas.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.storage_key.cmp(&b.storage_key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{normalize, SubjectKind};
    use chrono::Duration as ChronoDuration;

    fn metas(count: usize, size: u64) -> Vec<RecordMeta> {
        let base = Utc::now() - ChronoDuration::hours(1);
        (0..count)
            .map(|i| {
                let identity = normalize(&format!("site{i}.example"), SubjectKind::Url);
                RecordMeta {
                    storage_key: identity.storage_key(),
                    identity: Some(identity),
                    created_at: base + ChronoDuration::seconds(i as i64),
                    size_bytes: size,
                }
            })
            .collect()
    }

    fn policy() -> EvictionPolicy {
        EvictionPolicy::from_config(&CacheConfig::default())
    }

    #[test]
    fn test_within_bounds_evicts_nothing() {
        assert!(policy().plan(&metas(50, 100)).is_empty());
    }

    #[test]
    fn test_count_bound_keeps_newest() {
        let all = metas(60, 100);
        let expected = all[..10].to_vec();
        let mut shuffled = all;
        shuffled.reverse();
        let plan = policy().plan(&shuffled);

        assert_eq!(plan.reason, Some(EvictionReason::Count));
        assert_eq!(plan.victims, expected);
    }

    #[test]
    fn test_count_bound_with_smaller_keep() {
        let policy = EvictionPolicy {
            records_to_keep: 40,
            ..policy()
        };
        let plan = policy.plan(&metas(51, 1));
        assert_eq!(plan.victims.len(), 11);
    }

    #[test]
    fn test_size_bound_shrinks_to_target() {
        let policy = EvictionPolicy {
            max_records: 100,
            records_to_keep: 2,
            size_trigger_bytes: 800,
            size_target_bytes: 700,
            max_age: Duration::from_secs(3600),
        };

        // 10 x 100 bytes = 1000 > 800; must drop to below 700
        let all = metas(10, 100);
        let plan = policy.plan(&all);
        assert_eq!(plan.reason, Some(EvictionReason::Size));
        assert_eq!(plan.victims.len(), 4);
        assert_eq!(plan.victims[0], all[0]);
    }

    #[test]
    fn test_size_bound_respects_records_to_keep() {
        let policy = EvictionPolicy {
            max_records: 100,
            records_to_keep: 8,
            size_trigger_bytes: 800,
            size_target_bytes: 700,
            max_age: Duration::from_secs(3600),
        };

        let plan = policy.plan(&metas(10, 100));
        assert_eq!(plan.victims.len(), 2);
    }

    #[test]
    fn test_expired_selection() {
        let policy = EvictionPolicy {
            max_age: Duration::from_secs(30 * 60),
            ..policy()
        };
        let mut all = metas(3, 10);
        all[0].created_at = Utc::now() - ChronoDuration::hours(2);

        let plan = policy.plan_expired(&all, Utc::now());
        assert_eq!(plan.reason, Some(EvictionReason::Expired));
        assert_eq!(plan.victims.len(), 3);

        all.iter_mut().for_each(|m| m.created_at = Utc::now());
        assert!(policy.plan_expired(&all, Utc::now()).is_empty());
    }
}
