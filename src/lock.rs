//! Named mutual exclusion with owner tokens, conflict sets, and deadlock detection.
//!
//! This has no direct analogue in the teacher crate; it follows the crate's general
//! idiom (async, `tokio::sync` primitives, `thiserror`-based errors) built from scratch
//! against the specification in `SPEC_FULL.md` §4.1.

use crate::errors::{ReverieError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout as tokio_timeout;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockRecord {
    pub operation: String,
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub wait_ms: Option<u64>,
}

struct Inner {
    /// Live lock records, keyed by operation name.
    records: HashMap<String, LockRecord>,
    /// Declared conflict sets: operation name -> names that block its acquisition.
    conflicts: HashMap<String, HashSet<String>>,
    /// waits-for edges: waiter operation -> set of operations it is blocked on.
    waits_for: HashMap<String, HashSet<String>>,
}

/// Named mutual exclusion with conflict sets and cycle-based deadlock detection.
///
/// Per the spec's open question, `file_processing`, `demo_load`, and `reset` are wired
/// as pairwise-conflicting by whoever constructs the registry (see
/// [`OperationLock::with_default_conflicts`]).
pub struct OperationLock {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        OperationLock {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                conflicts: HashMap::new(),
                waits_for: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Wires `file_processing`, `demo_load`, and `reset` as pairwise conflicting, per
    /// §9's resolution of the open question on the exhaustive conflict set.
    pub fn with_default_conflicts() -> Self {
        let lock = Self::new();
        {
            // Constructing synchronously is fine: no contention exists yet.
            let mut guard = lock.inner.try_lock().expect("uncontended at construction");
            for name in ["file_processing", "demo_load", "reset"] {
                let others: HashSet<String> = ["file_processing", "demo_load", "reset"]
                    .iter()
                    .filter(|&&o| o != name)
                    .map(|s| s.to_string())
                    .collect();
                guard.conflicts.insert(name.to_string(), others);
            }
        }
        lock
    }

    /// Declares that `name`'s acquisition is blocked while any operation in `blocking_on`
    /// holds a live lock.
    pub async fn declare_conflict(&self, name: impl Into<String>, blocking_on: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner
            .conflicts
            .entry(name.into())
            .or_default()
            .extend(blocking_on);
    }

    pub async fn is_locked(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.records.contains_key(name)
    }

    /// Acquires the named operation, blocking while any conflicting operation is live.
    pub async fn acquire(&self, name: &str, options: AcquireOptions) -> Result<String> {
        let owner_token = Uuid::new_v4().to_string();
        let wait = options
            .wait_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(0));
        let start = std::time::Instant::now();

        loop {
            {
                let mut inner = self.inner.lock().await;
                let conflicting_live: Vec<String> = inner
                    .conflicts
                    .get(name)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|c| inner.records.contains_key(c))
                    .collect();

                if conflicting_live.is_empty() {
                    inner.waits_for.remove(name);
                    inner.records.insert(
                        name.to_string(),
                        LockRecord {
                            operation: name.to_string(),
                            owner_token: owner_token.clone(),
                            acquired_at: Utc::now(),
                            deadline: None,
                        },
                    );
                    return Ok(owner_token);
                }

                // Record the waits-for edges and check for a cycle before sleeping.
                inner
                    .waits_for
                    .insert(name.to_string(), conflicting_live.iter().cloned().collect());
                if let Some(cycle) = detect_cycle(&inner.waits_for, name) {
                    inner.waits_for.remove(name);
                    return Err(ReverieError::Deadlock {
                        operation: name.to_string(),
                        cycle,
                    });
                }

                if wait.is_zero() {
                    inner.waits_for.remove(name);
                    return Err(ReverieError::lock_acquisition(name));
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= wait {
                let mut inner = self.inner.lock().await;
                inner.waits_for.remove(name);
                return Err(ReverieError::LockTimeout {
                    operation: name.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let remaining = wait - elapsed;
            // Wake on any release; re-check conflicts on the next loop iteration.
            let _ = tokio_timeout(remaining, self.notify.notified()).await;
        }
    }

    pub async fn release(&self, name: &str, owner_token: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.records.get(name) {
            Some(record) if record.owner_token == owner_token => {
                inner.records.remove(name);
                drop(inner);
                self.notify.notify_waiters();
                Ok(())
            }
            Some(_) => Err(ReverieError::LockRelease {
                operation: name.to_string(),
                reason: "owner token does not match the live record".to_string(),
            }),
            None => Err(ReverieError::LockRelease {
                operation: name.to_string(),
                reason: "no live record exists".to_string(),
            }),
        }
    }

    /// Emergency drain: releases every live lock regardless of owner.
    pub async fn force_release_all(&self, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let names: Vec<String> = inner.records.keys().cloned().collect();
        inner.records.clear();
        inner.waits_for.clear();
        drop(inner);
        self.notify.notify_waiters();
        Err(ReverieError::ForceRelease {
            names,
            reason: reason.into(),
        })
    }
}

/// Depth-first search for a cycle in the waits-for graph starting from `start`.
fn detect_cycle(waits_for: &HashMap<String, HashSet<String>>, start: &str) -> Option<Vec<String>> {
    let mut path = vec![start.to_string()];
    let mut visited = HashSet::new();
    visited.insert(start.to_string());
    dfs_cycle(waits_for, start, &mut path, &mut visited)
}

fn dfs_cycle(
    waits_for: &HashMap<String, HashSet<String>>,
    current: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> Option<Vec<String>> {
    if let Some(next_ops) = waits_for.get(current) {
        for next in next_ops {
            if next == &path[0] && path.len() > 1 {
                let mut cycle = path.clone();
                cycle.push(next.clone());
                return Some(cycle);
            }
            if visited.insert(next.clone()) {
                path.push(next.clone());
                if let Some(cycle) = dfs_cycle(waits_for, next, path, visited) {
                    return Some(cycle);
                }
                path.pop();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let lock = OperationLock::with_default_conflicts();
        let token = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();
        assert!(lock.is_locked("file_processing").await);
        lock.release("file_processing", &token).await.unwrap();
        assert!(!lock.is_locked("file_processing").await);
    }

    #[tokio::test]
    async fn conflicting_operation_rejected_without_wait() {
        let lock = OperationLock::with_default_conflicts();
        let _token = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();
        let err = lock
            .acquire("demo_load", AcquireOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::LockAcquisition { .. }));
    }

    #[tokio::test]
    async fn non_conflicting_operation_proceeds_immediately() {
        let lock = OperationLock::with_default_conflicts();
        let _token = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();
        let other = lock
            .acquire("unrelated_op", AcquireOptions::default())
            .await
            .unwrap();
        assert!(!other.is_empty());
    }

    #[tokio::test]
    async fn release_with_wrong_token_fails() {
        let lock = OperationLock::with_default_conflicts();
        let _token = lock.acquire("reset", AcquireOptions::default()).await.unwrap();
        let err = lock.release("reset", "bogus-token").await.unwrap_err();
        assert!(matches!(err, ReverieError::LockRelease { .. }));
    }

    #[tokio::test]
    async fn lock_timeout_elapses_while_conflict_persists() {
        let lock = OperationLock::with_default_conflicts();
        let _token = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();
        let err = lock
            .acquire(
                "demo_load",
                AcquireOptions {
                    wait_ms: Some(30),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn waiter_proceeds_once_conflict_releases() {
        let lock = std::sync::Arc::new(OperationLock::with_default_conflicts());
        let token = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            waiter_lock
                .acquire("demo_load", AcquireOptions { wait_ms: Some(2000) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release("file_processing", &token).await.unwrap();

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn force_release_all_drains_locks() {
        let lock = OperationLock::with_default_conflicts();
        let _t = lock.acquire("file_processing", AcquireOptions::default()).await.unwrap();
        let err = lock.force_release_all("shutdown").await.unwrap_err();
        match err {
            ReverieError::ForceRelease { names, .. } => {
                assert_eq!(names, vec!["file_processing".to_string()]);
            }
            _ => panic!("expected ForceRelease"),
        }
        assert!(!lock.is_locked("file_processing").await);
    }
}
