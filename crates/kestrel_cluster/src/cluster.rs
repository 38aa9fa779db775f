//! In-process cluster assembly.
//!
//! [`KestrelCluster`] wires a config replica set, its catalog and config
//! server, any number of shard replica sets with their shard servers, and
//! the cluster control surface onto one [`InProcessTransport`]. Routers are
//! handed out on demand and talk to everything else only through the
//! transport, each with its own logical clock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use kestrel_common::authz::{AllowAll, AuthzGate, Principal};
use kestrel_common::config::KestrelConfig;
use kestrel_common::error::ShardingError;
use kestrel_common::pipeline::{MatchLimitExecutor, PipelineExecutor};
use kestrel_common::{ClusterClock, KestrelResult, ShardId, SystemWallClock, WallClock};
use kestrel_repl::{ReplSetSnapshot, ReplicaSet, ReplicaSetSource};

use crate::catalog::{ConfigServer, ShardCatalog};
use crate::control::{ClusterCommand, ClusterControl, CommandReply, ControlSnapshot};
use crate::fault_injection::{FaultInjector, Failpoints};
use crate::migration::{Balancer, BalancerSnapshot};
use crate::router::Router;
use crate::shard::{MaintenanceReport, ShardServer};
use crate::transport::{ClusterTransport, InProcessTransport, RpcClient, TransportSnapshot};

/// Optional collaborators for [`KestrelCluster`]. Defaults: system wall
/// clock, allow-all authorization, match/limit pipeline executor.
pub struct ClusterBuilder {
    config: KestrelConfig,
    wall: Arc<dyn WallClock>,
    authz: Arc<dyn AuthzGate>,
    executor: Arc<dyn PipelineExecutor>,
}

impl ClusterBuilder {
    pub fn new(config: KestrelConfig) -> Self {
        Self {
            config,
            wall: Arc::new(SystemWallClock),
            authz: Arc::new(AllowAll),
            executor: Arc::new(MatchLimitExecutor),
        }
    }

    pub fn wall_clock(mut self, wall: Arc<dyn WallClock>) -> Self {
        self.wall = wall;
        self
    }

    pub fn authz(mut self, authz: Arc<dyn AuthzGate>) -> Self {
        self.authz = authz;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn PipelineExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Start the config replica set and `cluster.shards` shards.
    pub fn build(self) -> KestrelResult<Arc<KestrelCluster>> {
        self.config.validate()?;
        let ClusterBuilder {
            config,
            wall,
            authz,
            executor,
        } = self;
        let faults = Arc::new(FaultInjector::new());
        let transport = InProcessTransport::new(Arc::clone(&faults));

        let config_rs = ReplicaSet::new(
            "config",
            config.cluster.config_nodes,
            ClusterClock::new(Arc::clone(&wall)),
            config.replication.clone(),
            config.storage.clone(),
        )?;
        let catalog = ShardCatalog::open(Arc::clone(&config_rs))?;
        transport.register_config(ConfigServer::new(Arc::clone(&catalog), Arc::clone(&authz)));

        let internal = RpcClient::new(
            transport.clone(),
            Arc::clone(config_rs.clock()),
            Principal::Internal,
            config.router.request_timeout(),
        );
        let control = ClusterControl::new(
            Arc::clone(&catalog),
            internal.clone(),
            Arc::clone(&authz),
        );
        let balancer = Balancer::new(Arc::clone(&catalog), internal, config.balancer.clone());

        let cluster = Arc::new(KestrelCluster {
            config,
            wall,
            authz,
            executor,
            faults,
            failpoints: Arc::new(Failpoints::new()),
            transport,
            config_rs,
            catalog,
            control,
            balancer,
            shards: RwLock::new(BTreeMap::new()),
        });
        for _ in 0..cluster.config.cluster.shards {
            cluster.add_shard()?;
        }
        tracing::info!(
            shards = cluster.config.cluster.shards,
            nodes_per_shard = cluster.config.cluster.nodes_per_shard,
            config_nodes = cluster.config.cluster.config_nodes,
            "cluster started"
        );
        Ok(cluster)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub shards: usize,
    pub transport: TransportSnapshot,
    pub control: ControlSnapshot,
    pub balancer: BalancerSnapshot,
    pub replica_sets: Vec<ReplSetSnapshot>,
}

/// Totals of one maintenance pass over every shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMaintenanceReport {
    pub shards_visited: usize,
    pub shards_failed: usize,
    pub decisions_delivered: usize,
    pub txns_expired: usize,
    pub orphans_deleted: u64,
    pub migrations_recovered: usize,
}

impl ClusterMaintenanceReport {
    fn add(&mut self, r: &MaintenanceReport) {
        self.decisions_delivered += r.decisions_delivered;
        self.txns_expired += r.txns_expired;
        self.orphans_deleted += r.orphans_deleted;
        self.migrations_recovered += r.migrations_recovered;
    }
}

pub struct KestrelCluster {
    config: KestrelConfig,
    wall: Arc<dyn WallClock>,
    authz: Arc<dyn AuthzGate>,
    executor: Arc<dyn PipelineExecutor>,
    faults: Arc<FaultInjector>,
    failpoints: Arc<Failpoints>,
    transport: Arc<InProcessTransport>,
    config_rs: Arc<ReplicaSet>,
    catalog: Arc<ShardCatalog>,
    control: Arc<ClusterControl>,
    balancer: Balancer,
    shards: RwLock<BTreeMap<ShardId, Arc<ShardServer>>>,
}

impl fmt::Debug for KestrelCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KestrelCluster")
            .field("shards", &self.shards.read().len())
            .field("config_rs", &self.config_rs.name())
            .finish()
    }
}

impl KestrelCluster {
    pub fn start(config: KestrelConfig) -> KestrelResult<Arc<Self>> {
        ClusterBuilder::new(config).build()
    }

    pub fn builder(config: KestrelConfig) -> ClusterBuilder {
        ClusterBuilder::new(config)
    }

    pub fn config(&self) -> &KestrelConfig {
        &self.config
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn failpoints(&self) -> &Arc<Failpoints> {
        &self.failpoints
    }

    pub fn transport(&self) -> &Arc<InProcessTransport> {
        &self.transport
    }

    pub fn catalog(&self) -> &Arc<ShardCatalog> {
        &self.catalog
    }

    pub fn config_replica_set(&self) -> &Arc<ReplicaSet> {
        &self.config_rs
    }

    pub fn control(&self) -> &Arc<ClusterControl> {
        &self.control
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    // ── Shards ──

    /// Start a new shard replica set and register it with the catalog.
    pub fn add_shard(&self) -> KestrelResult<ShardId> {
        let id = {
            let shards = self.shards.read();
            ShardId(shards.keys().next_back().map_or(1, |s| s.0 + 1))
        };
        let rs = ReplicaSet::new(
            format!("shard{}", id.0),
            self.config.cluster.nodes_per_shard,
            ClusterClock::new(Arc::clone(&self.wall)),
            self.config.replication.clone(),
            self.config.storage.clone(),
        )?;
        let server = ShardServer::new(
            id,
            rs,
            &self.config,
            self.transport.clone(),
            Arc::clone(&self.authz),
            Arc::clone(&self.failpoints),
        );
        self.transport.register_shard(id, server.clone());
        self.shards.write().insert(id, server);
        if let Err(e) = self.admin(ClusterCommand::AddShard { shard: id }) {
            self.transport.deregister_shard(id);
            self.shards.write().remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn shard(&self, id: ShardId) -> KestrelResult<Arc<ShardServer>> {
        self.shards
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ShardingError::ShardNotFound(id).into())
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.read().keys().copied().collect()
    }

    pub fn shard_servers(&self) -> Vec<Arc<ShardServer>> {
        self.shards.read().values().cloned().collect()
    }

    // ── Clients ──

    /// A router acting for `principal`, with its own clock and cache.
    pub fn router_as(&self, name: impl Into<String>, principal: Principal) -> Router {
        let transport: Arc<dyn ClusterTransport> = self.transport.clone();
        Router::new(
            name,
            transport,
            ClusterClock::new(Arc::clone(&self.wall)),
            principal,
            self.config.router.clone(),
            Arc::clone(&self.executor),
        )
    }

    /// A router acting as the internal principal.
    pub fn router(&self, name: impl Into<String>) -> Router {
        self.router_as(name, Principal::Internal)
    }

    /// Run a cluster command as the internal principal.
    pub fn admin(&self, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
        self.control.run(&Principal::Internal, cmd)
    }

    // ── Background work, driven by runners or directly by tests ──

    /// Replicate until every reachable secondary has caught up.
    pub fn sync_all(&self) {
        for rs in self.replica_sets() {
            rs.sync_all();
        }
    }

    /// One maintenance pass over every shard. A failing shard is logged and
    /// skipped.
    pub fn run_maintenance(&self) -> ClusterMaintenanceReport {
        let mut report = ClusterMaintenanceReport::default();
        for server in self.shard_servers() {
            report.shards_visited += 1;
            match server.run_maintenance() {
                Ok(r) => report.add(&r),
                Err(e) => {
                    report.shards_failed += 1;
                    tracing::warn!(shard = %server.id(), error = %e, "shard maintenance failed");
                }
            }
        }
        report
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            shards: self.shards.read().len(),
            transport: self.transport.snapshot(),
            control: self.control.snapshot(),
            balancer: self.balancer.snapshot(),
            replica_sets: self.replica_sets().iter().map(|rs| rs.snapshot()).collect(),
        }
    }
}

impl ReplicaSetSource for KestrelCluster {
    fn replica_sets(&self) -> Vec<Arc<ReplicaSet>> {
        let mut sets = vec![Arc::clone(&self.config_rs)];
        sets.extend(self.shards.read().values().map(|s| Arc::clone(s.replica_set())));
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::ManualWallClock;

    fn small() -> Arc<KestrelCluster> {
        let mut config = KestrelConfig::for_tests();
        config.cluster.shards = 2;
        config.cluster.nodes_per_shard = 3;
        config.cluster.config_nodes = 3;
        KestrelCluster::builder(config)
            .wall_clock(ManualWallClock::new(100))
            .build()
            .unwrap()
    }

    #[test]
    fn test_shards_registered_with_catalog() {
        let cluster = small();
        assert_eq!(cluster.shard_ids(), vec![ShardId(1), ShardId(2)]);
        let listed: Vec<ShardId> = cluster.catalog().list_shards().iter().map(|s| s.id).collect();
        assert_eq!(listed, cluster.shard_ids());
        assert_eq!(cluster.replica_sets().len(), 3);
    }

    #[test]
    fn test_add_shard_takes_next_id() {
        let cluster = small();
        let id = cluster.add_shard().unwrap();
        assert_eq!(id, ShardId(3));
        assert!(cluster.shard(id).is_ok());
        assert_eq!(cluster.snapshot().shards, 3);
    }

    #[test]
    fn test_unknown_shard() {
        let cluster = small();
        assert!(cluster.shard(ShardId(42)).is_err());
    }
}
