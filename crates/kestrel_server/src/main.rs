mod demo;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use kestrel_cluster::{BalancerRunner, KestrelCluster, ShardMaintenanceRunner};
use kestrel_common::config::KestrelConfig;
use kestrel_repl::{ReplicaSetSource, ReplicationRunner};

#[derive(Parser, Debug)]
#[command(name = "kestrel", about = "Kestrel: sharded, replicated document store")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "kestrel.toml")]
    config: String,

    /// Shards to bootstrap (overrides config).
    #[arg(long)]
    shards: Option<usize>,

    /// Members per shard replica set (overrides config).
    #[arg(long)]
    nodes_per_shard: Option<usize>,

    /// Prometheus listen address; enables the exporter.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Skip the demo workload.
    #[arg(long)]
    no_demo: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let default_config = KestrelConfig::default();
        let toml_str = toml::to_string_pretty(&default_config)
            .unwrap_or_else(|e| format!("# failed to serialize default config: {e}"));
        println!("{toml_str}");
        return Ok(());
    }

    kestrel_observability::init_tracing();
    tracing::info!("Starting Kestrel...");

    let mut config = load_config(&cli.config);
    apply_overrides(&mut config, &cli);
    config.validate()?;
    tracing::info!(config = ?config, "configuration loaded");

    if config.server.metrics_enabled {
        if let Err(e) = kestrel_observability::init_metrics(&config.server.metrics_listen_addr) {
            tracing::warn!(error = %e, "failed to initialize metrics");
        }
    }

    let cluster = KestrelCluster::start(config.clone())?;
    let source: Arc<dyn ReplicaSetSource> = cluster.clone();
    let replication = ReplicationRunner::start(config.replication.clone(), source)?;
    let maintenance = ShardMaintenanceRunner::start(Arc::clone(&cluster))?;
    let balancer = BalancerRunner::start(Arc::clone(&cluster))?;

    tracing::info!(
        node = %config.server.node_name,
        shards = cluster.shard_ids().len(),
        balancer = config.balancer.enabled,
        "Kestrel ready"
    );

    if config.server.demo_workload {
        let demo_cluster = Arc::clone(&cluster);
        let outcome = tokio::task::spawn_blocking(move || demo::run(&demo_cluster)).await;
        match outcome {
            Ok(Ok(report)) => tracing::info!(
                inserted = report.inserted,
                transferred = report.transferred,
                events = report.events,
                "demo workload finished"
            ),
            Ok(Err(e)) => tracing::warn!(error = %e, "demo workload failed"),
            Err(e) => tracing::warn!(error = %e, "demo workload panicked"),
        }
    }

    let reason = wait_for_shutdown_signal().await;
    tracing::info!("{reason}, shutting down");

    balancer.stop_and_join();
    maintenance.stop_and_join();
    replication.stop_and_join();
    let snapshot = cluster.snapshot();
    tracing::info!(
        shards = snapshot.shards,
        commands = snapshot.control.commands,
        "Kestrel stopped"
    );
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning a description of which signal fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT (Ctrl+C) received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

fn apply_overrides(config: &mut KestrelConfig, cli: &Cli) {
    if let Some(shards) = cli.shards {
        config.cluster.shards = shards;
    }
    if let Some(n) = cli.nodes_per_shard {
        config.cluster.nodes_per_shard = n;
    }
    if let Some(ref addr) = cli.metrics_addr {
        config.server.metrics_listen_addr = addr.clone();
        config.server.metrics_enabled = true;
    }
    if cli.no_demo {
        config.server.demo_workload = false;
    }
}

fn load_config(path: &str) -> KestrelConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}, using defaults", path, e);
                KestrelConfig::default()
            }
        },
        Err(_) => {
            tracing::info!("Config file {} not found, using defaults", path);
            KestrelConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[cluster]\nshards = 4\n\n[balancer]\nmax_chunk_size_bytes = 4096\n"
        )
        .unwrap();
        let config = load_config(file.path().to_str().unwrap());
        assert_eq!(config.cluster.shards, 4);
        assert_eq!(config.balancer.max_chunk_size_bytes, 4096);
        // Unset sections keep their defaults.
        assert_eq!(config.cluster.nodes_per_shard, 3);
    }

    #[test]
    fn test_missing_or_invalid_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = load_config(missing.to_str().unwrap());
        assert_eq!(config.cluster.shards, KestrelConfig::default().cluster.shards);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "cluster = [not toml").unwrap();
        let config = load_config(bad.to_str().unwrap());
        assert_eq!(config.cluster.shards, KestrelConfig::default().cluster.shards);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "kestrel",
            "--shards",
            "3",
            "--metrics-addr",
            "127.0.0.1:9999",
            "--no-demo",
        ]);
        let mut config = KestrelConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.cluster.shards, 3);
        assert!(config.server.metrics_enabled);
        assert_eq!(config.server.metrics_listen_addr, "127.0.0.1:9999");
        assert!(!config.server.demo_workload);
    }
}
