//! Critical sections: short windows during which a shard refuses writes (and,
//! once a migration is committing, reads) to part of its data.
//!
//! Blocked operations wait on a condition variable for the section to be
//! released and then re-check their routing version, which by then has
//! usually moved on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use kestrel_common::error::ShardingError;
use kestrel_common::shard_key::KeyBounds;
use kestrel_common::{KestrelResult, KeyRange, Namespace, ShardKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriticalScope {
    /// One chunk range of a collection (migration).
    Range { ns: Namespace, range: KeyRange },
    /// A whole collection (resharding, drop).
    Collection(Namespace),
    /// Every collection of a database (movePrimary, dropDatabase).
    Database(String),
}

impl CriticalScope {
    fn covers_ns(&self, ns: &Namespace) -> bool {
        match self {
            CriticalScope::Range { ns: n, .. } | CriticalScope::Collection(n) => n == ns,
            CriticalScope::Database(db) => *db == ns.db,
        }
    }

    fn covers(&self, ns: &Namespace, target: &WriteTarget) -> bool {
        if !self.covers_ns(ns) {
            return false;
        }
        match (self, target) {
            (CriticalScope::Range { range, .. }, WriteTarget::Key(k)) => range.contains(k),
            (CriticalScope::Range { range, .. }, WriteTarget::Bounds(b)) => {
                range.overlaps_bounds(b)
            }
            _ => true,
        }
    }
}

impl std::fmt::Display for CriticalScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CriticalScope::Range { ns, range } => write!(f, "{ns} {range}"),
            CriticalScope::Collection(ns) => write!(f, "{ns}"),
            CriticalScope::Database(db) => write!(f, "db {db}"),
        }
    }
}

/// Part of a collection an operation is about to touch.
#[derive(Debug, Clone)]
pub enum WriteTarget {
    /// A single shard-key value (inserts, targeted updates).
    Key(ShardKey),
    /// Whatever a filter can match.
    Bounds(KeyBounds),
    /// Unknown; any section on the collection blocks.
    Any,
}

#[derive(Debug, Clone)]
struct Section {
    reason: String,
    block_reads: bool,
    entered_at: Instant,
}

#[derive(Debug, Default)]
pub struct CriticalSections {
    active: Mutex<HashMap<CriticalScope, Section>>,
    released: Condvar,
    entered: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
}

impl CriticalSections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start blocking writes to `scope`. Re-entering with the same reason is
    /// a no-op; a different holder is a conflict.
    pub fn enter(&self, scope: CriticalScope, reason: &str) -> KestrelResult<()> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(&scope) {
            if existing.reason == reason {
                return Ok(());
            }
            return Err(ShardingError::ConflictingOperationInProgress(format!(
                "{scope} is held by {}",
                existing.reason
            ))
            .into());
        }
        tracing::info!(scope = %scope, reason, "critical section entered");
        active.insert(
            scope,
            Section {
                reason: reason.to_string(),
                block_reads: false,
                entered_at: Instant::now(),
            },
        );
        self.entered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Extend an entered section to reads as well.
    pub fn block_reads(&self, scope: &CriticalScope) {
        if let Some(s) = self.active.lock().get_mut(scope) {
            s.block_reads = true;
        }
    }

    /// Release `scope`. Returns false if it was not held.
    pub fn exit(&self, scope: &CriticalScope) -> bool {
        let removed = self.active.lock().remove(scope);
        match removed {
            Some(s) => {
                tracing::info!(
                    scope = %scope,
                    reason = %s.reason,
                    held_ms = s.entered_at.elapsed().as_millis() as u64,
                    "critical section released"
                );
                self.released.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, scope: &CriticalScope) -> bool {
        self.active.lock().contains_key(scope)
    }

    pub fn list(&self) -> Vec<(CriticalScope, String)> {
        self.active
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.reason.clone()))
            .collect()
    }

    /// Section that blocks a write to `target` in `ns`, if any.
    pub fn blocking_write(&self, ns: &Namespace, target: &WriteTarget) -> Option<CriticalScope> {
        self.active
            .lock()
            .keys()
            .find(|scope| scope.covers(ns, target))
            .cloned()
    }

    /// Section that blocks a read of `ns`, if any.
    pub fn blocking_read(&self, ns: &Namespace, target: &WriteTarget) -> Option<CriticalScope> {
        self.active
            .lock()
            .iter()
            .find(|(scope, s)| s.block_reads && scope.covers(ns, target))
            .map(|(scope, _)| scope.clone())
    }

    /// Wait until nothing blocks `target`, or fail at `deadline`.
    pub fn wait_clear(
        &self,
        ns: &Namespace,
        target: &WriteTarget,
        reads: bool,
        deadline: Instant,
    ) -> KestrelResult<()> {
        let mut active = self.active.lock();
        let mut waited = false;
        loop {
            let blocked = active
                .iter()
                .any(|(scope, s)| (!reads || s.block_reads) && scope.covers(ns, target));
            if !blocked {
                return Ok(());
            }
            if !waited {
                waited = true;
                self.waits.fetch_add(1, Ordering::Relaxed);
            }
            if self.released.wait_until(&mut active, deadline).timed_out() {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ShardingError::CriticalSectionTimeout { ns: ns.to_string() }.into());
            }
        }
    }

    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use kestrel_common::KestrelError;

    fn range(lo: i64, hi: i64) -> KeyRange {
        KeyRange::new(ShardKey::single(lo), ShardKey::single(hi))
    }

    #[test]
    fn test_range_section_blocks_only_keys_inside() {
        let cs = CriticalSections::new();
        let ns = Namespace::new("app", "users");
        let scope = CriticalScope::Range {
            ns: ns.clone(),
            range: range(0, 10),
        };
        cs.enter(scope.clone(), "migration").unwrap();
        assert!(cs.blocking_write(&ns, &WriteTarget::Key(ShardKey::single(5))).is_some());
        assert!(cs.blocking_write(&ns, &WriteTarget::Key(ShardKey::single(10))).is_none());
        assert!(cs
            .blocking_write(&Namespace::new("app", "other"), &WriteTarget::Any)
            .is_none());
        assert!(cs.blocking_read(&ns, &WriteTarget::Any).is_none());
        cs.block_reads(&scope);
        assert!(cs.blocking_read(&ns, &WriteTarget::Any).is_some());
        assert!(cs.exit(&scope));
        assert!(!cs.exit(&scope));
    }

    #[test]
    fn test_second_holder_conflicts() {
        let cs = CriticalSections::new();
        let scope = CriticalScope::Database("app".into());
        cs.enter(scope.clone(), "movePrimary").unwrap();
        cs.enter(scope.clone(), "movePrimary").unwrap();
        let err = cs.enter(scope, "dropDatabase").unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Sharding(ShardingError::ConflictingOperationInProgress(_))
        ));
    }

    #[test]
    fn test_waiter_wakes_on_release_and_times_out_otherwise() {
        let cs = Arc::new(CriticalSections::new());
        let ns = Namespace::new("app", "users");
        let scope = CriticalScope::Collection(ns.clone());
        cs.enter(scope.clone(), "reshard").unwrap();

        let err = cs
            .wait_clear(&ns, &WriteTarget::Any, false, Instant::now() + Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(cs.timeouts(), 1);

        let releaser = {
            let cs = Arc::clone(&cs);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cs.exit(&scope);
            })
        };
        cs.wait_clear(&ns, &WriteTarget::Any, false, Instant::now() + Duration::from_secs(5))
            .unwrap();
        releaser.join().unwrap();
    }
}
