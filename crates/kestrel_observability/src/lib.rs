//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,kestrel=debug";

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Install a subscriber for tests; later calls are no-ops.
pub fn try_init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Initialize the Prometheus metrics exporter.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

pub fn record_oplog_append(shard: &str, entries: usize) {
    metrics::counter!("kestrel_oplog_appends_total", "shard" => shard.to_string())
        .increment(entries as u64);
}

pub fn record_election(shard: &str, won: bool) {
    metrics::counter!(
        "kestrel_elections_total",
        "shard" => shard.to_string(),
        "won" => won.to_string()
    )
    .increment(1);
}

pub fn record_rollback(shard: &str, entries_truncated: usize) {
    metrics::counter!("kestrel_rollbacks_total", "shard" => shard.to_string()).increment(1);
    metrics::histogram!("kestrel_rollback_entries", "shard" => shard.to_string())
        .record(entries_truncated as f64);
}

pub fn record_replication_lag(shard: &str, lag_entries: u64) {
    metrics::gauge!("kestrel_replication_lag_entries", "shard" => shard.to_string())
        .set(lag_entries as f64);
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// `cause` is one of: "stale_config", "stale_db", "network".
pub fn record_routing_retry(cause: &str) {
    metrics::counter!("kestrel_routing_retries_total", "cause" => cause.to_string()).increment(1);
}

/// `kind` is "full" or "incremental".
pub fn record_routing_refresh(kind: &str, duration_us: u64) {
    metrics::counter!("kestrel_routing_refreshes_total", "kind" => kind.to_string()).increment(1);
    metrics::histogram!("kestrel_routing_refresh_duration_us").record(duration_us as f64);
}

pub fn record_router_op(op: &str, targets: usize, success: bool) {
    metrics::counter!(
        "kestrel_router_ops_total",
        "op" => op.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("kestrel_router_targets", "op" => op.to_string()).record(targets as f64);
}

// ---------------------------------------------------------------------------
// Migration / balancer
// ---------------------------------------------------------------------------

/// `outcome` is the terminal phase: "committed" or "aborted".
pub fn record_migration(outcome: &str, docs_cloned: u64, duration_ms: u64) {
    metrics::counter!("kestrel_migrations_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("kestrel_migration_docs_cloned").record(docs_cloned as f64);
    metrics::histogram!("kestrel_migration_duration_ms").record(duration_ms as f64);
}

pub fn record_balancer_round(migrations: usize, splits: usize) {
    metrics::counter!("kestrel_balancer_rounds_total").increment(1);
    metrics::counter!("kestrel_balancer_migrations_total").increment(migrations as u64);
    metrics::counter!("kestrel_balancer_splits_total").increment(splits as u64);
}

pub fn record_orphans_deleted(docs: u64) {
    metrics::counter!("kestrel_orphan_docs_deleted_total").increment(docs);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// `decision` is "commit" or "abort".
pub fn record_txn_decision(decision: &str, participants: usize) {
    metrics::counter!("kestrel_txn_decisions_total", "decision" => decision.to_string())
        .increment(1);
    metrics::histogram!("kestrel_txn_participants").record(participants as f64);
}

pub fn record_txn_recovered(decision: &str) {
    metrics::counter!(
        "kestrel_txn_coordinator_recoveries_total",
        "decision" => decision.to_string()
    )
        .increment(1);
}

// ---------------------------------------------------------------------------
// Change streams
// ---------------------------------------------------------------------------

pub fn record_change_stream_batch(events: usize) {
    metrics::counter!("kestrel_change_stream_batches_total").increment(1);
    metrics::counter!("kestrel_change_stream_events_total").increment(events as u64);
}

pub fn record_change_stream_opened(kind: &str) {
    metrics::counter!("kestrel_change_streams_opened_total", "kind" => kind.to_string())
        .increment(1);
}

// ---------------------------------------------------------------------------
// Cluster control
// ---------------------------------------------------------------------------

pub fn record_cluster_command(command: &str, success: bool, duration_ms: u64) {
    metrics::counter!(
        "kestrel_cluster_commands_total",
        "command" => command.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("kestrel_cluster_command_duration_ms", "command" => command.to_string())
        .record(duration_ms as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_helpers_without_recorder_are_noops() {
        record_oplog_append("shard0", 3);
        record_routing_retry("stale_config");
        record_migration("committed", 10, 5);
        record_txn_decision("commit", 2);
        record_change_stream_batch(4);
        record_cluster_command("moveChunk", true, 12);
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not an address").is_err());
    }
}
