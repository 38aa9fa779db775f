//! Config-server endpoint: serves catalog reads and the migration commit
//! protocol to routers and shards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_common::authz::{Action, AuthzGate, Principal, Resource};
use kestrel_common::KestrelResult;

use super::{ChunkVersionPair, ShardCatalog};
use crate::messages::{ConfigRequest, ConfigResponse};
use crate::transport::{ConfigService, Envelope, Reply};

#[derive(Debug, Default)]
struct ConfigServerMetrics {
    requests: AtomicU64,
    rejected: AtomicU64,
}

pub struct ConfigServer {
    catalog: Arc<ShardCatalog>,
    authz: Arc<dyn AuthzGate>,
    metrics: ConfigServerMetrics,
}

impl std::fmt::Debug for ConfigServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigServer")
            .field("requests", &self.metrics.requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConfigServer {
    pub fn new(catalog: Arc<ShardCatalog>, authz: Arc<dyn AuthzGate>) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            authz,
            metrics: ConfigServerMetrics::default(),
        })
    }

    pub fn catalog(&self) -> &Arc<ShardCatalog> {
        &self.catalog
    }

    fn dispatch(&self, principal: &Principal, req: ConfigRequest) -> KestrelResult<ConfigResponse> {
        if let Err(e) = self.authz.check(principal, Action::Internal, &Resource::Cluster) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.catalog.reload_if_term_changed()?;
        let c = &self.catalog;
        Ok(match req {
            ConfigRequest::GetDatabase { db, create } => {
                let existing = c.get_database(&db);
                match existing {
                    None if create => ConfigResponse::Database(Some(c.create_database(&db, None)?)),
                    other => ConfigResponse::Database(other),
                }
            }
            ConfigRequest::GetRouting { ns, since } => {
                ConfigResponse::Routing(c.routing_since(&ns, since))
            }
            ConfigRequest::ListShards => ConfigResponse::Shards(c.list_shards()),
            ConfigRequest::CommitChunkMigration {
                ns,
                epoch,
                range,
                donor,
                recipient,
            } => {
                let (moved, donor) =
                    c.commit_chunk_migration(&ns, epoch, &range, donor, recipient)?;
                ConfigResponse::MigrationCommitted(ChunkVersionPair { moved, donor })
            }
            ConfigRequest::PersistMigration(doc) => {
                c.persist_migration(doc)?;
                ConfigResponse::Ok
            }
            ConfigRequest::RemoveMigration { id } => {
                c.remove_migration(&id)?;
                ConfigResponse::Ok
            }
            ConfigRequest::MigrationsForDonor { donor } => {
                ConfigResponse::Migrations(c.migrations_for_donor(donor))
            }
            ConfigRequest::GetFcv => ConfigResponse::Fcv(c.fcv()),
        })
    }
}

impl ConfigService for ConfigServer {
    fn handle(&self, req: Envelope<ConfigRequest>) -> Reply<ConfigResponse> {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let clock = self.catalog.replica_set().clock();
        clock.advance(req.cluster_time);
        let kind = req.body.kind();
        let body = self.dispatch(&req.principal, req.body);
        if let Err(e) = &body {
            tracing::debug!(request = kind, error = %e, "config request failed");
        }
        Reply::new(clock, body)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use kestrel_common::authz::{AllowAll, StaticAuthz};
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::{ClusterClock, KestrelError, LogicalTimestamp, ManualWallClock, ShardId};
    use kestrel_repl::ReplicaSet;

    fn server(authz: Arc<dyn AuthzGate>) -> Arc<ConfigServer> {
        let clock = ClusterClock::new(ManualWallClock::new(100));
        let rs = ReplicaSet::new(
            "config",
            1,
            clock,
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let catalog = ShardCatalog::open(rs).unwrap();
        catalog.add_shard(ShardId(0)).unwrap();
        ConfigServer::new(catalog, authz)
    }

    fn envelope(principal: Principal, body: ConfigRequest) -> Envelope<ConfigRequest> {
        Envelope {
            cluster_time: LogicalTimestamp::new(500, 3),
            principal,
            deadline: Instant::now() + Duration::from_secs(1),
            body,
        }
    }

    #[test]
    fn test_get_database_creates_on_demand_and_gossips_time() {
        let s = server(Arc::new(AllowAll));
        let reply = s.handle(envelope(
            Principal::Internal,
            ConfigRequest::GetDatabase {
                db: "app".into(),
                create: false,
            },
        ));
        assert_eq!(reply.body.unwrap(), ConfigResponse::Database(None));
        assert!(reply.cluster_time >= LogicalTimestamp::new(500, 3));

        let reply = s.handle(envelope(
            Principal::Internal,
            ConfigRequest::GetDatabase {
                db: "app".into(),
                create: true,
            },
        ));
        let db = reply.body.unwrap().into_database().unwrap().unwrap();
        assert_eq!(db.primary, ShardId(0));
    }

    #[test]
    fn test_users_cannot_call_internal_endpoints() {
        let s = server(Arc::new(StaticAuthz::new()));
        let reply = s.handle(envelope(
            Principal::User("alice".into()),
            ConfigRequest::ListShards,
        ));
        assert!(matches!(reply.body, Err(KestrelError::Unauthorized { .. })));
    }
}
