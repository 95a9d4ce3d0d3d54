//! Single-flight execution of identical concurrent read queries.
//!
//! The first caller for a key runs the query; callers arriving while it is
//! in flight attach to the same slot and receive a clone of its outcome.
//! The leader takes the key out of the map before publishing, so the map
//! only ever holds slots that are still executing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use sluice_common::cancel::CancelToken;
use sluice_common::config::ConsolidatorConfig;
use sluice_common::datum::QueryResult;
use sluice_common::error::{SluiceError, SluiceResult};

const FOLLOWER_POLL: Duration = Duration::from_millis(20);

struct Slot {
    outcome: Mutex<Option<SluiceResult<QueryResult>>>,
    ready: Condvar,
    waiters: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidatorRole {
    Leader,
    Follower,
}

impl ConsolidatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidatorRole::Leader => "leader",
            ConsolidatorRole::Follower => "follower",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidatorStats {
    pub leaders: u64,
    pub followers: u64,
    pub in_flight: usize,
}

pub struct Consolidator {
    in_flight: DashMap<String, Arc<Slot>>,
    wait_timeout: Duration,
    leaders: AtomicU64,
    followers: AtomicU64,
}

/// Publishes on drop so followers are released even if the leader unwinds.
struct LeaderGuard<'a> {
    consolidator: &'a Consolidator,
    key: &'a str,
    slot: Arc<Slot>,
    published: bool,
}

impl LeaderGuard<'_> {
    fn publish(&mut self, outcome: &SluiceResult<QueryResult>) {
        self.published = true;
        let slot = &self.slot;
        self.consolidator
            .in_flight
            .remove_if(self.key, |_, v| Arc::ptr_eq(v, slot));
        // No follower can attach once the key is gone.
        let waiters = slot.waiters.load(Ordering::SeqCst);
        if waiters > 0 {
            *slot.outcome.lock() = Some(outcome.clone());
            slot.ready.notify_all();
        }
        tracing::debug!(key = self.key, waiters, "consolidated query published");
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(&Err(SluiceError::Internal(
                "consolidated query leader aborted before producing a result".into(),
            )));
        }
    }
}

impl Consolidator {
    pub fn new(config: &ConsolidatorConfig) -> Self {
        Self {
            in_flight: DashMap::new(),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
        }
    }

    /// Run `execute` unless an identical query is already in flight, in
    /// which case wait for that one and return a copy of its outcome.
    pub fn consolidate(
        &self,
        key: &str,
        cancel: &CancelToken,
        execute: impl FnOnce() -> SluiceResult<QueryResult>,
    ) -> (ConsolidatorRole, SluiceResult<QueryResult>) {
        let role = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(o) => {
                let slot = Arc::clone(o.get());
                slot.waiters.fetch_add(1, Ordering::SeqCst);
                (ConsolidatorRole::Follower, slot)
            }
            Entry::Vacant(v) => {
                let slot = Arc::new(Slot::new());
                v.insert(Arc::clone(&slot));
                (ConsolidatorRole::Leader, slot)
            }
        };

        match role {
            (ConsolidatorRole::Follower, slot) => {
                self.followers.fetch_add(1, Ordering::Relaxed);
                sluice_observability::record_consolidator_outcome(ConsolidatorRole::Follower.as_str());
                (ConsolidatorRole::Follower, self.wait_for(key, &slot, cancel))
            }
            (ConsolidatorRole::Leader, slot) => {
                self.leaders.fetch_add(1, Ordering::Relaxed);
                sluice_observability::record_consolidator_outcome(ConsolidatorRole::Leader.as_str());
                let mut guard = LeaderGuard {
                    consolidator: self,
                    key,
                    slot,
                    published: false,
                };
                let outcome = execute();
                guard.publish(&outcome);
                (ConsolidatorRole::Leader, outcome)
            }
        }
    }

    fn wait_for(&self, key: &str, slot: &Slot, cancel: &CancelToken) -> SluiceResult<QueryResult> {
        let deadline = (!self.wait_timeout.is_zero()).then(|| Instant::now() + self.wait_timeout);
        let mut outcome = slot.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            cancel.check()?;
            let mut wait = FOLLOWER_POLL;
            if let Some(d) = deadline {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    tracing::warn!(key, "gave up waiting for consolidated query");
                    return Err(SluiceError::DeadlineExceeded(format!(
                        "timed out after {}ms waiting for consolidated query",
                        self.wait_timeout.as_millis()
                    )));
                }
                wait = wait.min(left);
            }
            let _ = slot.ready.wait_for(&mut outcome, wait);
        }
    }

    pub fn stats(&self) -> ConsolidatorStats {
        ConsolidatorStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    use super::*;
    use sluice_common::datum::{DataType, Datum, Field, OwnedRow};

    fn consolidator() -> Consolidator {
        Consolidator::new(&ConsolidatorConfig {
            enabled: true,
            wait_timeout_ms: 5_000,
        })
    }

    fn result() -> QueryResult {
        QueryResult::new(
            vec![Field::new("id", DataType::Int64)],
            vec![OwnedRow::new(vec![Datum::Int64(7)])],
        )
    }

    #[test]
    fn test_single_caller_runs_and_cleans_up() {
        let c = consolidator();
        let (role, res) = c.consolidate("k", &CancelToken::new(), || Ok(result()));
        assert_eq!(role, ConsolidatorRole::Leader);
        assert_eq!(res.unwrap(), result());
        assert_eq!(c.stats().in_flight, 0);
    }

    #[test]
    fn test_followers_share_one_execution() {
        let c = consolidator();
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(10);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        c.consolidate("select 1", &CancelToken::new(), || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            Ok(result())
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|(_, r)| r.as_ref().unwrap() == &result()));
        let stats = c.stats();
        assert_eq!((stats.leaders, stats.followers, stats.in_flight), (1, 9, 0));
    }

    #[test]
    fn test_error_delivered_to_followers() {
        let c = consolidator();
        let barrier = Barrier::new(4);
        let errors: Vec<SluiceError> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        c.consolidate("k", &CancelToken::new(), || {
                            std::thread::sleep(Duration::from_millis(80));
                            Err(SluiceError::transport("user/-80@replica", "connection reset"))
                        })
                        .1
                        .unwrap_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(errors.iter().all(|e| e == &errors[0]));
    }

    #[test]
    fn test_leader_panic_releases_followers() {
        let c = consolidator();
        let started = Barrier::new(2);
        std::thread::scope(|s| {
            let leader = s.spawn(|| {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    c.consolidate("k", &CancelToken::new(), || {
                        started.wait();
                        std::thread::sleep(Duration::from_millis(80));
                        panic!("shard driver bug");
                    })
                }));
            });
            started.wait();
            let (role, res) = c.consolidate("k", &CancelToken::new(), || Ok(result()));
            assert_eq!(role, ConsolidatorRole::Follower);
            assert!(matches!(res, Err(SluiceError::Internal(_))));
            leader.join().unwrap();
        });
        assert_eq!(c.stats().in_flight, 0);
    }

    #[test]
    fn test_cancelled_follower_returns_early() {
        let c = consolidator();
        let started = Barrier::new(2);
        std::thread::scope(|s| {
            s.spawn(|| {
                c.consolidate("k", &CancelToken::new(), || {
                    started.wait();
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(result())
                })
            });
            started.wait();
            let cancel = CancelToken::new();
            cancel.cancel("client closed connection");
            let (_, res) = c.consolidate("k", &cancel, || Ok(result()));
            assert!(matches!(res, Err(SluiceError::Cancelled(_))));
        });
    }
}
