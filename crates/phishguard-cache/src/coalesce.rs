//! Single-flight execution per identity.
//!
//! The first caller for an identity spawns the work as a detached tokio task
//! and publishes a [`Shared`] handle to its outcome; later callers for the
//! same identity await that handle instead of starting new work. The table
//! entry is removed by the task itself when it settles, so the next caller
//! after a failure starts fresh.
//!
//! Waiters can be cancelled (dropped, timed out) without affecting the task:
//! other waiters may still need its result.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::CacheError;
use crate::key::Identity;

type Outcome = Result<String, CacheError>;
type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;
type InFlightTable = Arc<Mutex<HashMap<Identity, SharedOutcome>>>;

/// How a caller took part in a coalesced computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the computation
    Leader,
    /// Attached to a computation already in flight
    Follower,
}

/// Table of computations in flight, keyed by identity.
#[derive(Default)]
pub struct RequestCoalescer {
    in_flight: InFlightTable,
}

impl RequestCoalescer {
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` unless a computation for `identity` is already in flight,
    /// in which case wait for that one. Every caller receives the same
    /// outcome.
    pub async fn run_exclusive<F, Fut>(&self, identity: &Identity, task: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let (_, outcome) = self.join_or_start(identity, task);
        outcome.await
    }

    /// Attach to the in-flight computation for `identity`, or start `task`.
    ///
    /// `task` is only invoked when this caller becomes the leader. Must be
    /// called from within a tokio runtime.
    pub fn join_or_start<F, Fut>(&self, identity: &Identity, task: F) -> (Role, SharedOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let mut table = self.in_flight.lock();
        if let Some(existing) = table.get(identity) {
            tracing::trace!(identity = %identity, "Joining in-flight generation");
            return (Role::Follower, existing.clone());
        }

        let settle = SettleGuard {
            table: Arc::clone(&self.in_flight),
            identity: identity.clone(),
        };
        let work = task();
        let handle = tokio::spawn(async move {
            let _settle = settle;
            work.await
        });

        let outcome = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::TaskAborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        table.insert(identity.clone(), outcome.clone());
        tracing::debug!(identity = %identity, in_flight = table.len(), "Started generation");
        (Role::Leader, outcome)
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether a computation for `identity` is in flight.
    pub fn is_in_flight(&self, identity: &Identity) -> bool {
        self.in_flight.lock().contains_key(identity)
    }
}

impl std::fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Removes the table entry when the task finishes, panics or is dropped by
/// runtime shutdown.
struct SettleGuard {
    table: InFlightTable,
    identity: Identity,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{normalize, SubjectKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn identity() -> Identity {
        normalize("https://bank-example.com/login", SubjectKind::Url)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_run() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coalescer
                    .run_exclusive(&identity(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("explanation".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "explanation");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_waiters_and_clears_entry() {
        let coalescer = RequestCoalescer::new();
        let (role_a, first) = coalescer.join_or_start(&identity(), || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(CacheError::TaskAborted("provider down".into()))
        });
        let (role_b, second) = coalescer.join_or_start(&identity(), || async {
            Ok::<_, CacheError>("never".to_string())
        });

        assert_eq!(role_a, Role::Leader);
        assert_eq!(role_b, Role::Follower);
        assert!(coalescer.is_in_flight(&identity()));

        let (a, b) = tokio::join!(first, second);
        assert!(a.unwrap_err().to_string().contains("provider down"));
        assert!(b.unwrap_err().to_string().contains("provider down"));
        assert!(!coalescer.is_in_flight(&identity()));

        // A new caller starts a fresh run
        let retried = coalescer
            .run_exclusive(&identity(), || async { Ok("recovered".to_string()) })
            .await;
        assert_eq!(retried.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_task() {
        let coalescer = RequestCoalescer::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);

        let waited = tokio::time::timeout(
            Duration::from_millis(10),
            coalescer.run_exclusive(&identity(), move || async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok("late".to_string())
            }),
        )
        .await;
        assert!(waited.is_err());

        // Still running for anyone who attaches later
        assert!(coalescer.is_in_flight(&identity()));
        let (role, outcome) =
            coalescer.join_or_start(&identity(), || async { Ok("second".to_string()) });
        assert_eq!(role, Role::Follower);
        assert_eq!(outcome.await.unwrap(), "late");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_and_cleared() {
        let coalescer = RequestCoalescer::new();
        let result = coalescer
            .run_exclusive(&identity(), || async {
                if true {
                    panic!("generator bug");
                }
                Ok(String::new())
            })
            .await;

        assert!(matches!(result, Err(CacheError::TaskAborted(_))));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_identities_run_independently() {
        let coalescer = RequestCoalescer::new();
        let a = normalize("a.example", SubjectKind::Url);
        let b = normalize("b.example", SubjectKind::Url);

        let (role_a, fa) = coalescer.join_or_start(&a, || async { Ok("a".to_string()) });
        let (role_b, fb) = coalescer.join_or_start(&b, || async { Ok("b".to_string()) });
        assert_eq!((role_a, role_b), (Role::Leader, Role::Leader));
        assert_eq!(coalescer.in_flight(), 2);

        assert_eq!(fa.await.unwrap(), "a");
        assert_eq!(fb.await.unwrap(), "b");
    }
}
