use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Top-level configuration, loaded from `kestrel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub txn: TxnConfig,
    #[serde(default)]
    pub change_stream: ChangeStreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in log lines and metric labels.
    pub node_name: String,
    /// Prometheus exporter listen address.
    pub metrics_listen_addr: String,
    pub metrics_enabled: bool,
    /// Run the built-in demo workload after bootstrap.
    pub demo_workload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: "kestrel-0".into(),
            metrics_listen_addr: "127.0.0.1:9187".into(),
            metrics_enabled: false,
            demo_workload: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Shards bootstrapped at startup.
    pub shards: usize,
    /// Members per shard replica set.
    pub nodes_per_shard: usize,
    /// Members of the config server replica set.
    pub config_nodes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: 2,
            nodes_per_shard: 3,
            config_nodes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub heartbeat_interval_ms: u64,
    /// A primary that cannot reach a majority for this long loses its lease.
    pub lease_ms: u64,
    pub write_concern_timeout_ms: u64,
    /// Max oplog entries shipped to a secondary per pull.
    pub batch_size: usize,
    /// Replication runner tick.
    pub apply_interval_ms: u64,
    /// Let the runner elect a new primary when the current one is down.
    pub auto_failover: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            lease_ms: 10_000,
            write_concern_timeout_ms: 5_000,
            batch_size: 512,
            apply_interval_ms: 5,
            auto_failover: true,
        }
    }
}

impl ReplicationConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn write_concern_timeout(&self) -> Duration {
        Duration::from_millis(self.write_concern_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Refresh-and-retry attempts on staleness before failing the operation.
    pub max_stale_retries: u32,
    /// Retries for network-like failures of retryable operations.
    pub max_network_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomized fraction of the backoff added as jitter (0.0–1.0).
    pub jitter_ratio: f64,
    /// Deadline attached to every router-to-shard request.
    pub request_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_stale_retries: 10,
            max_network_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 200,
            jitter_ratio: 0.25,
            request_timeout_ms: 5_000,
        }
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff before retry number `attempt` (0-indexed), without jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * 2f64.powi(attempt.min(30) as i32);
        Duration::from_millis(base.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub clone_batch_size: usize,
    /// Catch-up rounds before the migration gives up converging.
    pub max_catchup_rounds: u32,
    /// Writes blocked by a critical section wait at most this long.
    pub critical_section_timeout_ms: u64,
    /// Safety window before a donor deletes a migrated range.
    pub orphan_cleanup_delay_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 1_000,
            max_catchup_rounds: 100,
            critical_section_timeout_ms: 5_000,
            orphan_cleanup_delay_ms: 15_000,
        }
    }
}

impl MigrationConfig {
    pub fn critical_section_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_section_timeout_ms)
    }

    pub fn orphan_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.orphan_cleanup_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Chunks above this size are split; also the imbalance threshold.
    pub max_chunk_size_bytes: u64,
    pub auto_split: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            max_chunk_size_bytes: 1 << 20,
            auto_split: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Unprepared transactions idle longer than this are aborted by the primary.
    pub transaction_lifetime_ms: u64,
    /// Delay before a fully acknowledged coordinator document is removed.
    pub coordinator_gc_delay_ms: u64,
    pub resolver_interval_ms: u64,
    /// How long a read waits on a prepared transaction before failing.
    pub prepare_conflict_timeout_ms: u64,
    /// How long a non-transactional write waits on a document lock.
    pub lock_wait_timeout_ms: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            transaction_lifetime_ms: 60_000,
            coordinator_gc_delay_ms: 1_000,
            resolver_interval_ms: 100,
            prepare_conflict_timeout_ms: 2_000,
            lock_wait_timeout_ms: 500,
        }
    }
}

impl TxnConfig {
    pub fn transaction_lifetime(&self) -> Duration {
        Duration::from_millis(self.transaction_lifetime_ms)
    }

    pub fn coordinator_gc_delay(&self) -> Duration {
        Duration::from_millis(self.coordinator_gc_delay_ms)
    }

    pub fn prepare_conflict_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_conflict_timeout_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeStreamConfig {
    pub batch_size: usize,
    /// Max events a shard returns per fetch.
    pub shard_fetch_limit: usize,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            shard_fetch_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Versions older than the majority point minus this window are pruned.
    pub history_window_secs: u32,
    /// Oplog entries kept before head truncation (0 = unbounded).
    pub oplog_max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_window_secs: 300,
            oplog_max_entries: 0,
        }
    }
}

impl KestrelConfig {
    pub fn validate(&self) -> KestrelResult<()> {
        let mut problems = Vec::new();
        if self.cluster.shards == 0 {
            problems.push("cluster.shards must be at least 1");
        }
        if self.cluster.nodes_per_shard == 0 {
            problems.push("cluster.nodes_per_shard must be at least 1");
        }
        if self.cluster.config_nodes == 0 {
            problems.push("cluster.config_nodes must be at least 1");
        }
        if self.router.max_stale_retries == 0 {
            problems.push("router.max_stale_retries must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.router.jitter_ratio) {
            problems.push("router.jitter_ratio must be within [0, 1]");
        }
        if self.replication.batch_size == 0 {
            problems.push("replication.batch_size must be at least 1");
        }
        if self.migration.clone_batch_size == 0 {
            problems.push("migration.clone_batch_size must be at least 1");
        }
        if self.migration.max_catchup_rounds == 0 {
            problems.push("migration.max_catchup_rounds must be at least 1");
        }
        if self.balancer.max_chunk_size_bytes == 0 {
            problems.push("balancer.max_chunk_size_bytes must be positive");
        }
        if self.change_stream.batch_size == 0 {
            problems.push("change_stream.batch_size must be at least 1");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(KestrelError::Config(problems.join("; ")))
        }
    }

    /// Configuration suited to in-process tests: short windows, no auto-balancing.
    pub fn for_tests() -> Self {
        let mut cfg = Self::default();
        cfg.server.demo_workload = false;
        cfg.balancer.enabled = false;
        cfg.migration.orphan_cleanup_delay_ms = 0;
        cfg.migration.critical_section_timeout_ms = 500;
        cfg.replication.write_concern_timeout_ms = 1_000;
        cfg.txn.coordinator_gc_delay_ms = 0;
        cfg.txn.prepare_conflict_timeout_ms = 200;
        cfg.txn.lock_wait_timeout_ms = 100;
        cfg.router.request_timeout_ms = 2_000;
        cfg.router.initial_backoff_ms = 1;
        cfg.router.max_backoff_ms = 5;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        KestrelConfig::default().validate().unwrap();
        KestrelConfig::for_tests().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: KestrelConfig = toml::from_str("[cluster]\nshards = 4\n").unwrap();
        assert_eq!(cfg.cluster.shards, 4);
        assert_eq!(cfg.cluster.nodes_per_shard, 3);
        assert_eq!(cfg.router.max_stale_retries, 10);
    }

    #[test]
    fn test_validate_rejects_zero_shards_and_retries() {
        let mut cfg = KestrelConfig::default();
        cfg.cluster.shards = 0;
        cfg.router.max_stale_retries = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("cluster.shards"));
        assert!(err.contains("max_stale_retries"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let r = RouterConfig::default();
        assert_eq!(r.backoff_for_attempt(0), Duration::from_millis(5));
        assert_eq!(r.backoff_for_attempt(1), Duration::from_millis(10));
        assert_eq!(r.backoff_for_attempt(20), Duration::from_millis(200));
    }

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&KestrelConfig::default()).unwrap();
        let back: KestrelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.balancer.max_chunk_size_bytes, 1 << 20);
    }
}
