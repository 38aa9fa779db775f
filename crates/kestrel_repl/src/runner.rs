//! Background replication loop: ships oplog batches, renews leases, elects a
//! new primary when one is missing and advances the history window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_common::config::ReplicationConfig;
use kestrel_common::shutdown::ShutdownSignal;
use kestrel_common::{KestrelError, KestrelResult};

use crate::replica_set::ReplicaSet;

/// Supplies the replica sets the runner drives. Shards may be added while
/// the runner is alive, so the list is re-read every tick.
pub trait ReplicaSetSource: Send + Sync {
    fn replica_sets(&self) -> Vec<Arc<ReplicaSet>>;
}

impl ReplicaSetSource for Vec<Arc<ReplicaSet>> {
    fn replica_sets(&self) -> Vec<Arc<ReplicaSet>> {
        self.clone()
    }
}

#[derive(Debug, Default)]
pub struct ReplicationRunnerMetrics {
    pub ticks: AtomicU64,
    pub entries_applied: AtomicU64,
    pub failovers_triggered: AtomicU64,
    pub failovers_succeeded: AtomicU64,
    pub failovers_failed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ReplicationRunnerSnapshot {
    pub ticks: u64,
    pub entries_applied: u64,
    pub failovers_triggered: u64,
    pub failovers_succeeded: u64,
    pub failovers_failed: u64,
}

impl ReplicationRunnerMetrics {
    pub fn snapshot(&self) -> ReplicationRunnerSnapshot {
        ReplicationRunnerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
            failovers_triggered: self.failovers_triggered.load(Ordering::Relaxed),
            failovers_succeeded: self.failovers_succeeded.load(Ordering::Relaxed),
            failovers_failed: self.failovers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Handle returned by `ReplicationRunner::start()`. Dropping stops the thread.
pub struct ReplicationRunnerHandle {
    signal: ShutdownSignal,
    join_handle: Option<std::thread::JoinHandle<()>>,
    pub metrics: Arc<ReplicationRunnerMetrics>,
}

impl ReplicationRunnerHandle {
    pub fn stop(&self) {
        self.signal.shutdown();
    }

    pub fn stop_and_join(mut self) {
        self.signal.shutdown();
        if let Some(h) = self.join_handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.signal.is_shutdown()
    }
}

impl Drop for ReplicationRunnerHandle {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

pub struct ReplicationRunner;

impl ReplicationRunner {
    pub fn start(
        config: ReplicationConfig,
        source: Arc<dyn ReplicaSetSource>,
    ) -> KestrelResult<ReplicationRunnerHandle> {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();
        let interval = Duration::from_millis(config.apply_interval_ms.max(1));
        let heartbeat_every = Duration::from_millis(config.heartbeat_interval_ms);
        let metrics = Arc::new(ReplicationRunnerMetrics::default());
        let metrics_clone = Arc::clone(&metrics);

        let join_handle = std::thread::Builder::new()
            .name("kestrel-replication".to_string())
            .spawn(move || {
                tracing::info!(
                    interval_ms = config.apply_interval_ms,
                    auto_failover = config.auto_failover,
                    "replication runner started"
                );
                let mut last_heartbeat = Instant::now();
                while !signal_clone.is_shutdown() {
                    if signal_clone.wait_timeout(interval) {
                        break;
                    }
                    metrics_clone.ticks.fetch_add(1, Ordering::Relaxed);
                    let beat = last_heartbeat.elapsed() >= heartbeat_every;
                    if beat {
                        last_heartbeat = Instant::now();
                    }
                    for set in source.replica_sets() {
                        let applied = set.replicate_once();
                        metrics_clone
                            .entries_applied
                            .fetch_add(applied as u64, Ordering::Relaxed);
                        if beat {
                            set.heartbeat();
                            set.advance_history();
                        }
                        if config.auto_failover && set.primary().is_err() {
                            Self::failover(&set, &metrics_clone);
                        }
                    }
                }
                tracing::info!("replication runner stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = "replication-runner",
                    error = %e,
                    "failed to spawn background thread"
                );
                KestrelError::Internal(format!("failed to spawn replication thread: {e}"))
            })?;

        Ok(ReplicationRunnerHandle {
            signal,
            join_handle: Some(join_handle),
            metrics,
        })
    }

    fn failover(set: &ReplicaSet, metrics: &ReplicationRunnerMetrics) {
        metrics.failovers_triggered.fetch_add(1, Ordering::Relaxed);
        match set.step_up_best() {
            Ok(id) => {
                metrics.failovers_succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(set = set.name(), node = %id, "failover succeeded");
            }
            Err(e) => {
                metrics.failovers_failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(set = set.name(), error = %e, "failover not possible yet");
            }
        }
    }
}
