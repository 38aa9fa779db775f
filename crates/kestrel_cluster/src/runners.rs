//! Background loops for a [`KestrelCluster`]: shard maintenance and the
//! balancer. Replication is driven by `kestrel_repl::ReplicationRunner`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::shutdown::ShutdownSignal;
use kestrel_common::{KestrelError, KestrelResult};

use crate::cluster::KestrelCluster;

#[derive(Debug, Default)]
pub struct RunnerMetrics {
    pub ticks: AtomicU64,
    pub failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerSnapshot {
    pub ticks: u64,
    pub failures: u64,
}

impl RunnerMetrics {
    pub fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a background loop. Dropping it stops the thread.
pub struct RunnerHandle {
    name: &'static str,
    signal: ShutdownSignal,
    join_handle: Option<std::thread::JoinHandle<()>>,
    pub metrics: Arc<RunnerMetrics>,
}

impl RunnerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

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

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

/// Run `tick` every `interval` on a named thread until stopped.
fn spawn_loop(
    name: &'static str,
    interval: Duration,
    mut tick: impl FnMut() -> KestrelResult<()> + Send + 'static,
) -> KestrelResult<RunnerHandle> {
    let signal = ShutdownSignal::new();
    let signal_clone = signal.clone();
    let metrics = Arc::new(RunnerMetrics::default());
    let metrics_clone = Arc::clone(&metrics);
    let interval = interval.max(Duration::from_millis(1));

    let join_handle = std::thread::Builder::new()
        .name(format!("kestrel-{name}"))
        .spawn(move || {
            tracing::info!(
                runner = name,
                interval_ms = interval.as_millis() as u64,
                "runner started",
            );
            while !signal_clone.is_shutdown() {
                if signal_clone.wait_timeout(interval) {
                    break;
                }
                metrics_clone.ticks.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = tick() {
                    metrics_clone.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(runner = name, error = %e, "runner tick failed");
                }
            }
            tracing::info!(runner = name, "runner stopped");
        })
        .map_err(|e| {
            tracing::error!(component = name, error = %e, "failed to spawn background thread");
            KestrelError::Internal(format!("failed to spawn {name} thread: {e}"))
        })?;

    Ok(RunnerHandle {
        name,
        signal,
        join_handle: Some(join_handle),
        metrics,
    })
}

/// Transaction recovery and expiry, migration recovery and orphan cleanup
/// on every shard.
pub struct ShardMaintenanceRunner;

impl ShardMaintenanceRunner {
    pub fn start(cluster: Arc<KestrelCluster>) -> KestrelResult<RunnerHandle> {
        let interval = Duration::from_millis(cluster.config().txn.resolver_interval_ms);
        spawn_loop("shard-maintenance", interval, move || {
            let report = cluster.run_maintenance();
            if report.orphans_deleted > 0
                || report.decisions_delivered > 0
                || report.migrations_recovered > 0
            {
                tracing::debug!(
                    orphans_deleted = report.orphans_deleted,
                    decisions_delivered = report.decisions_delivered,
                    migrations_recovered = report.migrations_recovered,
                    txns_expired = report.txns_expired,
                    "maintenance pass"
                );
            }
            Ok(())
        })
    }
}

pub struct BalancerRunner;

impl BalancerRunner {
    pub fn start(cluster: Arc<KestrelCluster>) -> KestrelResult<RunnerHandle> {
        let interval = Duration::from_millis(cluster.config().balancer.interval_ms);
        spawn_loop("balancer", interval, move || {
            cluster.balancer().run_round().map(|_| ())
        })
    }
}
