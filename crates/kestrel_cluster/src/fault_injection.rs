//! Fault injection for failure-mode testing.
//!
//! Two kinds of fault are supported:
//! - **Network faults** on the in-process transport: unreachable endpoints,
//!   requests lost before delivery, replies lost after the remote side has
//!   already executed the request, and added latency.
//! - **Named failpoints** that make a component stop at a specific step as
//!   if its process had died there.
//!
//! Both are shared through `Arc`s and checked by the code under test before
//! the relevant step.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use kestrel_common::{KestrelError, KestrelResult};

use crate::transport::Endpoint;

/// The 2PC coordinator stops after its decision is durable and before it
/// tells any participant.
pub const HANG_BEFORE_DELIVERING_DECISION: &str = "hangBeforeDeliveringDecision";
/// The migration donor aborts once the initial clone has been shipped.
pub const MIGRATION_FAIL_AFTER_CLONE: &str = "migrationFailAfterClone";
/// The donor stops inside the critical section, before asking the config
/// server to commit.
pub const MIGRATION_CRASH_BEFORE_COMMIT: &str = "migrationCrashBeforeCommit";
/// The donor stops right after the config server committed the move.
pub const MIGRATION_CRASH_AFTER_COMMIT: &str = "migrationCrashAfterCommit";

// ── Network faults ──

#[derive(Debug, Default)]
struct NetworkState {
    unreachable: HashSet<Endpoint>,
    dropped_requests: HashSet<&'static str>,
    /// Remaining reply drops per request kind.
    dropped_replies: HashMap<&'static str, u32>,
}

#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<NetworkState>,
    latency_us: AtomicU64,
    faults_fired: AtomicU64,
    partition_events: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` unreachable from everyone.
    pub fn isolate(&self, endpoint: Endpoint) {
        let mut st = self.state.lock();
        if st.unreachable.insert(endpoint) {
            self.partition_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%endpoint, "endpoint isolated");
        }
    }

    pub fn heal(&self, endpoint: Endpoint) {
        if self.state.lock().unreachable.remove(&endpoint) {
            tracing::info!(%endpoint, "endpoint reachable again");
        }
    }

    pub fn is_unreachable(&self, endpoint: Endpoint) -> bool {
        self.state.lock().unreachable.contains(&endpoint)
    }

    /// Lose every request of `kind` before it is delivered.
    pub fn drop_requests(&self, kind: &'static str) {
        self.state.lock().dropped_requests.insert(kind);
    }

    pub fn allow_requests(&self, kind: &'static str) {
        self.state.lock().dropped_requests.remove(kind);
    }

    /// Lose the reply of the next `times` requests of `kind`; the requests
    /// themselves still execute.
    pub fn drop_replies(&self, kind: &'static str, times: u32) {
        self.state.lock().dropped_replies.insert(kind, times);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    pub fn partition_events(&self) -> u64 {
        self.partition_events.load(Ordering::Relaxed)
    }

    /// Clear every network fault.
    pub fn reset(&self) {
        *self.state.lock() = NetworkState::default();
        self.latency_us.store(0, Ordering::Relaxed);
    }

    /// Checked by the transport before a request reaches `endpoint`.
    pub fn before_delivery(&self, endpoint: Endpoint, kind: &'static str) -> KestrelResult<()> {
        let st = self.state.lock();
        if st.unreachable.contains(&endpoint) {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(KestrelError::network(endpoint, "host unreachable"));
        }
        if st.dropped_requests.contains(kind) {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(KestrelError::network(endpoint, format!("{kind} request lost")));
        }
        Ok(())
    }

    /// Checked by the transport after `endpoint` executed a request.
    pub fn after_delivery(&self, endpoint: Endpoint, kind: &'static str) -> KestrelResult<()> {
        let mut st = self.state.lock();
        if let Some(left) = st.dropped_replies.get_mut(kind) {
            if *left > 0 {
                *left -= 1;
                self.faults_fired.fetch_add(1, Ordering::Relaxed);
                return Err(KestrelError::network(endpoint, format!("{kind} reply lost")));
            }
        }
        Ok(())
    }
}

// ── Failpoints ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailpointMode {
    AlwaysOn,
    /// Fire this many more times, then turn off.
    Times(u32),
}

#[derive(Debug, Default)]
pub struct Failpoints {
    armed: Mutex<HashMap<String, FailpointMode>>,
    fired: AtomicU64,
}

impl Failpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, name: &str) {
        self.armed
            .lock()
            .insert(name.to_string(), FailpointMode::AlwaysOn);
        tracing::info!(failpoint = name, "failpoint enabled");
    }

    pub fn enable_times(&self, name: &str, times: u32) {
        self.armed
            .lock()
            .insert(name.to_string(), FailpointMode::Times(times));
    }

    pub fn disable(&self, name: &str) {
        if self.armed.lock().remove(name).is_some() {
            tracing::info!(failpoint = name, "failpoint disabled");
        }
    }

    /// Consume one firing of `name`, if armed.
    pub fn should_fire(&self, name: &str) -> bool {
        let mut armed = self.armed.lock();
        let fire = match armed.get_mut(name) {
            None => false,
            Some(FailpointMode::AlwaysOn) => true,
            Some(FailpointMode::Times(n)) => {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    armed.remove(name);
                }
                true
            }
        };
        if fire {
            self.fired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(failpoint = name, "failpoint fired");
        }
        fire
    }

    /// `Err` standing in for a process that died at `name`.
    pub fn check(&self, name: &str, component: impl std::fmt::Display) -> KestrelResult<()> {
        if self.should_fire(name) {
            return Err(KestrelError::network(
                component,
                format!("interrupted at failpoint {name}"),
            ));
        }
        Ok(())
    }

    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::ShardId;

    #[test]
    fn test_isolated_endpoint_is_unreachable_until_healed() {
        let f = FaultInjector::new();
        let ep = Endpoint::Shard(ShardId(1));
        f.isolate(ep);
        let err = f.before_delivery(ep, "find").unwrap_err();
        assert!(err.is_network_like());
        assert!(f.before_delivery(Endpoint::Config, "find").is_ok());
        f.heal(ep);
        assert!(f.before_delivery(ep, "find").is_ok());
        assert_eq!(f.partition_events(), 1);
    }

    #[test]
    fn test_reply_drops_are_counted_down() {
        let f = FaultInjector::new();
        let ep = Endpoint::Shard(ShardId(0));
        f.drop_replies("write", 2);
        assert!(f.after_delivery(ep, "write").is_err());
        assert!(f.after_delivery(ep, "find").is_ok());
        assert!(f.after_delivery(ep, "write").is_err());
        assert!(f.after_delivery(ep, "write").is_ok());
        assert_eq!(f.faults_fired(), 2);
    }

    #[test]
    fn test_failpoint_times_mode_turns_itself_off() {
        let fp = Failpoints::new();
        fp.enable_times(MIGRATION_FAIL_AFTER_CLONE, 1);
        assert!(fp.should_fire(MIGRATION_FAIL_AFTER_CLONE));
        assert!(!fp.should_fire(MIGRATION_FAIL_AFTER_CLONE));
        fp.enable(HANG_BEFORE_DELIVERING_DECISION);
        assert!(fp.check(HANG_BEFORE_DELIVERING_DECISION, "shard0").is_err());
        assert!(fp.check(HANG_BEFORE_DELIVERING_DECISION, "shard0").is_err());
        fp.disable(HANG_BEFORE_DELIVERING_DECISION);
        assert!(fp.check(HANG_BEFORE_DELIVERING_DECISION, "shard0").is_ok());
        assert_eq!(fp.fired(), 3);
    }
}
