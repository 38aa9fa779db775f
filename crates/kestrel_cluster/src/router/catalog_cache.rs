//! Router-side cache of database placements and collection routing tables.
//!
//! Entries are loaded lazily and kept until a shard reports staleness. A
//! stale collection keeps its table so the next refresh can ask the catalog
//! for only the chunks changed since the cached version; a new epoch always
//! comes back as a full table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use kestrel_common::error::ShardingError;
use kestrel_common::{
    DatabaseVersion, KestrelError, KestrelResult, Namespace, ShardId,
};

use crate::catalog::{CollectionRouting, DatabaseEntry, RoutingUpdate};
use crate::messages::{ConfigRequest, VersionCheck};
use crate::transport::RpcClient;

/// Where a namespace's operations go.
#[derive(Debug, Clone)]
pub enum Route {
    /// The database does not exist.
    NoDatabase,
    Unsharded {
        primary: ShardId,
        version: DatabaseVersion,
    },
    Sharded(Arc<CollectionRouting>),
}

impl Route {
    /// Version attached to a request for `shard`.
    pub fn version_for(&self, shard: ShardId) -> VersionCheck {
        match self {
            Route::NoDatabase => VersionCheck::Unchecked,
            Route::Unsharded { version, .. } => VersionCheck::Unsharded(*version),
            Route::Sharded(r) => VersionCheck::Sharded(r.chunks.shard_version(shard)),
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, Route::Sharded(_))
    }
}

#[derive(Debug, Clone)]
struct CachedDatabase {
    entry: Option<DatabaseEntry>,
    stale: bool,
}

#[derive(Debug, Clone)]
struct CachedCollection {
    routing: Option<Arc<CollectionRouting>>,
    stale: bool,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    database_refreshes: AtomicU64,
    full_refreshes: AtomicU64,
    incremental_refreshes: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCacheSnapshot {
    pub hits: u64,
    pub database_refreshes: u64,
    pub full_refreshes: u64,
    pub incremental_refreshes: u64,
    pub invalidations: u64,
}

pub struct CatalogCache {
    rpc: RpcClient,
    databases: DashMap<String, CachedDatabase>,
    collections: DashMap<Namespace, CachedCollection>,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for CatalogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogCache")
            .field("databases", &self.databases.len())
            .field("collections", &self.collections.len())
            .finish()
    }
}

impl CatalogCache {
    /// `rpc` must act as an internal principal.
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            databases: DashMap::new(),
            collections: DashMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Route for `ns`. With `create_db` a missing database is created
    /// through the catalog, as the first write to it would.
    pub fn route(&self, ns: &Namespace, create_db: bool) -> KestrelResult<Route> {
        let Some(db) = self.database(&ns.db, create_db)? else {
            return Ok(Route::NoDatabase);
        };
        Ok(match self.routing(ns)? {
            Some(r) => Route::Sharded(r),
            None => Route::Unsharded {
                primary: db.primary,
                version: db.version,
            },
        })
    }

    pub fn database(&self, db: &str, create: bool) -> KestrelResult<Option<DatabaseEntry>> {
        // Missing databases are not cached; another router may create them.
        if let Some(cached) = self.databases.get(db) {
            if !cached.stale && cached.entry.is_some() {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.entry.clone());
            }
        }
        let started = Instant::now();
        let entry = self
            .rpc
            .config(ConfigRequest::GetDatabase {
                db: db.to_string(),
                create,
            })?
            .into_database()?;
        self.metrics.database_refreshes.fetch_add(1, Ordering::Relaxed);
        kestrel_observability::record_routing_refresh(
            "database",
            started.elapsed().as_micros() as u64,
        );
        tracing::debug!(
            db,
            primary = ?entry.as_ref().map(|e| e.primary),
            "database placement refreshed"
        );
        self.databases.insert(
            db.to_string(),
            CachedDatabase {
                entry: entry.clone(),
                stale: false,
            },
        );
        Ok(entry)
    }

    /// Cached routing table, `None` when `ns` is not sharded.
    pub fn routing(&self, ns: &Namespace) -> KestrelResult<Option<Arc<CollectionRouting>>> {
        let cached = self.collections.get(ns).map(|c| c.clone());
        match cached {
            Some(c) if !c.stale => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Ok(c.routing)
            }
            Some(c) => self.refresh(ns, c.routing),
            None => self.refresh(ns, None),
        }
    }

    fn refresh(
        &self,
        ns: &Namespace,
        cached: Option<Arc<CollectionRouting>>,
    ) -> KestrelResult<Option<Arc<CollectionRouting>>> {
        let started = Instant::now();
        let since = cached.as_ref().map(|r| r.version());
        let update = self
            .rpc
            .config(ConfigRequest::GetRouting {
                ns: ns.clone(),
                since,
            })?
            .into_routing()?;
        let (routing, kind) = match apply(cached.as_deref(), update) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::debug!(
                    ns = %ns,
                    error = %e,
                    "incremental routing refresh rejected, reloading",
                );
                let full = self
                    .rpc
                    .config(ConfigRequest::GetRouting {
                        ns: ns.clone(),
                        since: None,
                    })?
                    .into_routing()?;
                apply(None, full)?
            }
        };
        match kind {
            "incremental" => self.metrics.incremental_refreshes.fetch_add(1, Ordering::Relaxed),
            _ => self.metrics.full_refreshes.fetch_add(1, Ordering::Relaxed),
        };
        kestrel_observability::record_routing_refresh(kind, started.elapsed().as_micros() as u64);
        tracing::debug!(
            ns = %ns,
            kind,
            version = ?routing.as_ref().map(|r| r.version()),
            "routing table refreshed"
        );
        self.collections.insert(
            ns.clone(),
            CachedCollection {
                routing: routing.clone(),
                stale: false,
            },
        );
        Ok(routing)
    }

    pub fn invalidate_collection(&self, ns: &Namespace) {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Some(mut c) = self.collections.get_mut(ns) {
            c.stale = true;
        }
    }

    pub fn invalidate_database(&self, db: &str) {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        if let Some(mut d) = self.databases.get_mut(db) {
            d.stale = true;
        }
        // Unsharded collections follow the database primary.
        for mut c in self.collections.iter_mut() {
            if c.key().db == db && c.routing.is_none() {
                c.stale = true;
            }
        }
    }

    /// React to a staleness error a shard returned for an operation on `ns`.
    pub fn on_stale(&self, ns: &Namespace, err: &KestrelError) {
        match err {
            KestrelError::Sharding(ShardingError::StaleDbVersion { .. }) => {
                self.invalidate_database(&ns.db);
                self.invalidate_collection(ns);
            }
            KestrelError::Sharding(ShardingError::StaleConfig { wanted, .. }) => {
                let cached = self.collections.get(ns).and_then(|c| c.routing.clone());
                let epoch_changed = match (wanted, cached) {
                    (Some(w), Some(r)) => w.epoch != r.epoch(),
                    _ => false,
                };
                if epoch_changed {
                    // Nothing of the old table can be reused.
                    self.collections.remove(ns);
                    self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.invalidate_collection(ns);
                }
                // The collection may also have become (un)sharded.
                if wanted.is_none() {
                    if let Some(mut d) = self.databases.get_mut(&ns.db) {
                        d.stale = true;
                    }
                }
            }
            _ => {
                self.invalidate_database(&ns.db);
                self.invalidate_collection(ns);
            }
        }
    }

    /// Forget everything about `db`.
    pub fn purge_database(&self, db: &str) {
        self.databases.remove(db);
        self.collections.retain(|ns, _| ns.db != db);
    }

    pub fn clear(&self) {
        self.databases.clear();
        self.collections.clear();
    }

    pub fn snapshot(&self) -> CatalogCacheSnapshot {
        CatalogCacheSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            database_refreshes: self.metrics.database_refreshes.load(Ordering::Relaxed),
            full_refreshes: self.metrics.full_refreshes.load(Ordering::Relaxed),
            incremental_refreshes: self.metrics.incremental_refreshes.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Merge a catalog answer into the cached table.
fn apply(
    cached: Option<&CollectionRouting>,
    update: RoutingUpdate,
) -> KestrelResult<(Option<Arc<CollectionRouting>>, &'static str)> {
    match update {
        RoutingUpdate::NotSharded => Ok((None, "full")),
        RoutingUpdate::Full(r) => Ok((Some(Arc::new(r)), "full")),
        RoutingUpdate::Incremental {
            entry,
            changed,
            collection_version,
        } => {
            let Some(cached) = cached.filter(|c| c.epoch() == collection_version.epoch) else {
                return Err(ShardingError::StaleConfig {
                    ns: entry.ns.to_string(),
                    shard: ShardId(0),
                    received: cached.map(|c| c.version()),
                    wanted: Some(collection_version),
                }
                .into());
            };
            let mut next = cached.clone();
            next.entry = entry;
            next.chunks.apply_changes(changed)?;
            next.chunks.validate()?;
            Ok((Some(Arc::new(next)), "incremental"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChunkMap, CollectionEntry};
    use kestrel_common::{CollectionUuid, KeyValue, ShardKey, ShardKeyPattern};

    fn ns() -> Namespace {
        Namespace::new("app", "users")
    }

    fn table() -> CollectionRouting {
        let pattern = ShardKeyPattern::ranged(&["uid"]);
        let chunks = ChunkMap::single(ns(), pattern.clone(), ShardId(1));
        CollectionRouting {
            entry: CollectionEntry {
                ns: ns(),
                uuid: CollectionUuid::generate(),
                key_pattern: pattern,
                unique: false,
                resharding: false,
            },
            chunks,
        }
    }

    #[test]
    fn test_incremental_update_applies_changed_chunks() {
        let base = table();
        let mut moved = base.chunks.clone();
        moved.split(&ShardKey(vec![KeyValue::Int(100)])).unwrap();
        let since = base.version();
        let changed = moved.changed_since(&since);
        let update = RoutingUpdate::Incremental {
            entry: base.entry.clone(),
            changed,
            collection_version: moved.collection_version(),
        };
        let (next, kind) = apply(Some(&base), update).unwrap();
        let next = next.unwrap();
        assert_eq!(kind, "incremental");
        assert_eq!(next.chunks.chunks().len(), 2);
        assert_eq!(next.version(), moved.collection_version());
    }

    #[test]
    fn test_incremental_update_with_new_epoch_is_rejected() {
        let base = table();
        let other = table();
        let update = RoutingUpdate::Incremental {
            entry: other.entry.clone(),
            changed: other.chunks.chunks().to_vec(),
            collection_version: other.version(),
        };
        let err = apply(Some(&base), update).unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_not_sharded_clears_table() {
        let (r, kind) = apply(Some(&table()), RoutingUpdate::NotSharded).unwrap();
        assert!(r.is_none());
        assert_eq!(kind, "full");
    }

    #[test]
    fn test_route_versions() {
        let r = Arc::new(table());
        let route = Route::Sharded(Arc::clone(&r));
        assert_eq!(
            route.version_for(ShardId(1)),
            VersionCheck::Sharded(r.chunks.shard_version(ShardId(1)))
        );
        assert_eq!(Route::NoDatabase.version_for(ShardId(1)), VersionCheck::Unchecked);
        assert!(route.is_sharded());
    }
}
