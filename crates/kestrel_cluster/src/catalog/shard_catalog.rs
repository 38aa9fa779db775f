//! The authoritative shard catalog, hosted on the config replica set.
//!
//! All mutations funnel through one lock, are persisted as documents in the
//! `config` database with majority write concern, and only then become
//! visible in memory. After a config-server failover the in-memory view is
//! rebuilt from whatever the new primary holds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kestrel_common::error::ShardingError;
use kestrel_common::{
    ChunkVersion, CollectionUuid, DatabaseVersion, Epoch, KestrelError, KestrelResult, KeyRange,
    Namespace, ShardId, ShardKey, ShardKeyPattern, WriteConcern,
};
use kestrel_repl::ReplicaSet;

use super::chunk_map::{Chunk, ChunkMap};
use super::fcv::{FcvState, FeatureVersion};
use crate::durable;
use crate::migration::MigrationDocument;

const SHARDS: &str = "shards";
const DATABASES: &str = "databases";
const COLLECTIONS: &str = "collections";
const MIGRATIONS: &str = "migrations";
const VERSION: &str = "version";
const FCV_DOC: &str = "featureCompatibilityVersion";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub id: ShardId,
    pub draining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub primary: ShardId,
    pub version: DatabaseVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub key_pattern: ShardKeyPattern,
    pub unique: bool,
    /// Set while a reshard operation owns the collection.
    pub resharding: bool,
}

/// A sharded collection's catalog entry together with its chunk map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRouting {
    pub entry: CollectionEntry,
    pub chunks: ChunkMap,
}

impl CollectionRouting {
    pub fn epoch(&self) -> Epoch {
        self.chunks.epoch()
    }

    pub fn version(&self) -> ChunkVersion {
        self.chunks.collection_version()
    }
}

/// Answer to a routing-table refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingUpdate {
    /// The collection is not (or no longer) sharded.
    NotSharded,
    /// Replace the cached table wholesale.
    Full(CollectionRouting),
    /// Splice `changed` into a cached table of the same epoch.
    Incremental {
        entry: CollectionEntry,
        changed: Vec<Chunk>,
        collection_version: ChunkVersion,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveShardStatus {
    Started,
    Ongoing {
        chunks: usize,
        databases: Vec<String>,
    },
    Completed,
}

#[derive(Debug, Default)]
struct CatalogMetrics {
    mutations: AtomicU64,
    reloads: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct CatalogState {
    shards: BTreeMap<ShardId, ShardEntry>,
    databases: BTreeMap<String, DatabaseEntry>,
    collections: BTreeMap<Namespace, CollectionRouting>,
    migrations: BTreeMap<String, MigrationDocument>,
    fcv: FcvState,
}

/// One pending catalog document write: `None` deletes.
struct CatalogWrite {
    coll: &'static str,
    id: String,
    value: Option<Value>,
}

impl CatalogWrite {
    fn put(
        coll: &'static str,
        id: impl Into<String>,
        value: &impl Serialize,
    ) -> KestrelResult<Self> {
        Ok(Self {
            coll,
            id: id.into(),
            value: Some(
                serde_json::to_value(value)
                    .map_err(|e| KestrelError::Internal(format!("catalog encode: {e}")))?,
            ),
        })
    }

    fn delete(coll: &'static str, id: impl Into<String>) -> Self {
        Self {
            coll,
            id: id.into(),
            value: None,
        }
    }
}

pub struct ShardCatalog {
    rs: Arc<ReplicaSet>,
    state: Mutex<CatalogState>,
    loaded_term: AtomicU64,
    metrics: CatalogMetrics,
}

impl std::fmt::Debug for ShardCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCatalog")
            .field("config_rs", &self.rs.name())
            .finish()
    }
}

impl ShardCatalog {
    /// Open the catalog on `rs`, loading whatever it already persists.
    pub fn open(rs: Arc<ReplicaSet>) -> KestrelResult<Arc<Self>> {
        let catalog = Arc::new(Self {
            rs,
            state: Mutex::new(CatalogState::default()),
            loaded_term: AtomicU64::new(0),
            metrics: CatalogMetrics::default(),
        });
        catalog.reload()?;
        Ok(catalog)
    }

    pub fn replica_set(&self) -> &Arc<ReplicaSet> {
        &self.rs
    }

    /// Rebuild the in-memory view from the config primary.
    pub fn reload(&self) -> KestrelResult<()> {
        let storage = self.rs.primary_storage()?;
        let mut st = self.state.lock();
        let mut fresh = CatalogState::default();
        for s in load_docs::<ShardEntry>(&storage, SHARDS)? {
            fresh.shards.insert(s.id, s);
        }
        for d in load_docs::<DatabaseEntry>(&storage, DATABASES)? {
            fresh.databases.insert(d.name.clone(), d);
        }
        for c in load_docs::<CollectionRouting>(&storage, COLLECTIONS)? {
            c.chunks.validate()?;
            fresh.collections.insert(c.entry.ns.clone(), c);
        }
        for m in load_docs::<MigrationDocument>(&storage, MIGRATIONS)? {
            fresh.migrations.insert(m.id.clone(), m);
        }
        if let Some(fcv) = load_docs::<FcvState>(&storage, VERSION)?.into_iter().next() {
            fresh.fcv = fcv;
        }
        *st = fresh;
        self.loaded_term.store(self.rs.term(), Ordering::SeqCst);
        self.metrics.reloads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            shards = st.shards.len(),
            databases = st.databases.len(),
            collections = st.collections.len(),
            "shard catalog loaded"
        );
        Ok(())
    }

    /// Reload if the config replica set elected a new primary since the last load.
    pub fn reload_if_term_changed(&self) -> KestrelResult<()> {
        if self.rs.term() != self.loaded_term.load(Ordering::SeqCst) {
            self.reload()?;
        }
        Ok(())
    }

    fn persist(&self, writes: Vec<CatalogWrite>) -> KestrelResult<()> {
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            for cw in &writes {
                let ns = Namespace::new("config", cw.coll);
                match &cw.value {
                    Some(v) => durable::log_put(w, &ns, &cw.id, v)?,
                    None => durable::log_delete(w, &ns, &cw.id)?,
                }
            }
            Ok(())
        })?;
        self.metrics.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ── Shards ──

    pub fn add_shard(&self, id: ShardId) -> KestrelResult<ShardEntry> {
        let mut st = self.state.lock();
        if st.shards.contains_key(&id) {
            return Err(ShardingError::ShardExists(id).into());
        }
        let entry = ShardEntry { id, draining: false };
        self.persist(vec![CatalogWrite::put(SHARDS, id.to_string(), &entry)?])?;
        st.shards.insert(id, entry.clone());
        tracing::info!(shard = %id, "shard added");
        Ok(entry)
    }

    pub fn list_shards(&self) -> Vec<ShardEntry> {
        self.state.lock().shards.values().cloned().collect()
    }

    /// Start draining `id`, report progress, or finish removal once it holds
    /// no chunks and is primary for no database.
    pub fn remove_shard(&self, id: ShardId) -> KestrelResult<RemoveShardStatus> {
        let mut st = self.state.lock();
        let entry = st
            .shards
            .get(&id)
            .cloned()
            .ok_or(ShardingError::ShardNotFound(id))?;
        if !entry.draining {
            if st.shards.values().filter(|s| !s.draining).count() <= 1 {
                return Err(KestrelError::IllegalOperation(
                    "cannot remove the last shard".into(),
                ));
            }
            let draining = ShardEntry { id, draining: true };
            self.persist(vec![CatalogWrite::put(SHARDS, id.to_string(), &draining)?])?;
            st.shards.insert(id, draining);
            tracing::info!(shard = %id, "shard draining");
            return Ok(RemoveShardStatus::Started);
        }
        let chunks: usize = st
            .collections
            .values()
            .map(|c| c.chunks.chunks_on(id).len())
            .sum();
        let databases: Vec<String> = st
            .databases
            .values()
            .filter(|d| d.primary == id)
            .map(|d| d.name.clone())
            .collect();
        if chunks > 0 || !databases.is_empty() {
            return Ok(RemoveShardStatus::Ongoing { chunks, databases });
        }
        self.persist(vec![CatalogWrite::delete(SHARDS, id.to_string())])?;
        st.shards.remove(&id);
        tracing::info!(shard = %id, "shard removed");
        Ok(RemoveShardStatus::Completed)
    }

    fn require_active_shard(st: &CatalogState, id: ShardId) -> KestrelResult<()> {
        match st.shards.get(&id) {
            None => Err(ShardingError::ShardNotFound(id).into()),
            Some(s) if s.draining => Err(ShardingError::ShardDraining(id).into()),
            Some(_) => Ok(()),
        }
    }

    // ── Databases ──

    pub fn get_database(&self, db: &str) -> Option<DatabaseEntry> {
        self.state.lock().databases.get(db).cloned()
    }

    /// Create `db` if missing. Without an explicit primary, picks the
    /// non-draining shard that is primary for the fewest databases.
    pub fn create_database(
        &self,
        db: &str,
        primary: Option<ShardId>,
    ) -> KestrelResult<DatabaseEntry> {
        if db.is_empty() || db == "config" || db == "admin" || db == "local" {
            return Err(KestrelError::BadValue(format!("cannot create database '{db}'")));
        }
        let mut st = self.state.lock();
        if let Some(existing) = st.databases.get(db) {
            return Ok(existing.clone());
        }
        let primary = match primary {
            Some(p) => {
                Self::require_active_shard(&st, p)?;
                p
            }
            None => {
                let mut load: BTreeMap<ShardId, usize> = st
                    .shards
                    .values()
                    .filter(|s| !s.draining)
                    .map(|s| (s.id, 0))
                    .collect();
                for d in st.databases.values() {
                    if let Some(n) = load.get_mut(&d.primary) {
                        *n += 1;
                    }
                }
                load.into_iter()
                    .min_by_key(|(id, n)| (*n, *id))
                    .map(|(id, _)| id)
                    .ok_or_else(|| KestrelError::IllegalOperation("no shards available".into()))?
            }
        };
        let entry = DatabaseEntry {
            name: db.to_string(),
            primary,
            version: DatabaseVersion::generate(),
        };
        self.persist(vec![CatalogWrite::put(DATABASES, db, &entry)?])?;
        st.databases.insert(db.to_string(), entry.clone());
        tracing::info!(db, primary = %primary, "database created");
        Ok(entry)
    }

    pub fn commit_move_primary(&self, db: &str, to: ShardId) -> KestrelResult<DatabaseEntry> {
        let mut st = self.state.lock();
        Self::require_active_shard(&st, to)?;
        let mut entry = st
            .databases
            .get(db)
            .cloned()
            .ok_or_else(|| ShardingError::DatabaseNotFound(db.to_string()))?;
        if entry.primary == to {
            return Ok(entry);
        }
        entry.primary = to;
        entry.version = entry.version.bump();
        self.persist(vec![CatalogWrite::put(DATABASES, db, &entry)?])?;
        st.databases.insert(db.to_string(), entry.clone());
        tracing::info!(db, primary = %to, version = %entry.version, "database primary moved");
        Ok(entry)
    }

    /// Remove `db` and every sharded collection in it. Returns the removed
    /// collections.
    pub fn drop_database(&self, db: &str) -> KestrelResult<Vec<CollectionRouting>> {
        let mut st = self.state.lock();
        let dropped: Vec<CollectionRouting> = st
            .collections
            .values()
            .filter(|c| c.entry.ns.db == db)
            .cloned()
            .collect();
        let mut writes: Vec<CatalogWrite> = dropped
            .iter()
            .map(|c| CatalogWrite::delete(COLLECTIONS, c.entry.ns.to_string()))
            .collect();
        writes.push(CatalogWrite::delete(DATABASES, db));
        self.persist(writes)?;
        for c in &dropped {
            st.collections.remove(&c.entry.ns);
        }
        st.databases.remove(db);
        Ok(dropped)
    }

    // ── Collections ──

    pub fn get_collection(&self, ns: &Namespace) -> Option<CollectionRouting> {
        self.state.lock().collections.get(ns).cloned()
    }

    pub fn list_collections(&self) -> Vec<CollectionRouting> {
        self.state.lock().collections.values().cloned().collect()
    }

    fn require_collection(st: &CatalogState, ns: &Namespace) -> KestrelResult<CollectionRouting> {
        st.collections
            .get(ns)
            .cloned()
            .ok_or_else(|| ShardingError::NotSharded(ns.to_string()).into())
    }

    /// Register `ns` as sharded. The database must exist. Sharding an
    /// already-sharded collection with the same key is a no-op.
    pub fn shard_collection(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        key_pattern: ShardKeyPattern,
        unique: bool,
        presplit_chunks_per_shard: Option<usize>,
    ) -> KestrelResult<CollectionRouting> {
        if key_pattern.fields.is_empty() {
            return Err(KestrelError::BadValue("shard key must name at least one field".into()));
        }
        if unique && key_pattern.hashed {
            return Err(KestrelError::BadValue("hashed shard keys cannot be unique".into()));
        }
        let mut st = self.state.lock();
        let db = st
            .databases
            .get(&ns.db)
            .cloned()
            .ok_or_else(|| ShardingError::DatabaseNotFound(ns.db.clone()))?;
        if let Some(existing) = st.collections.get(ns) {
            if existing.entry.key_pattern == key_pattern {
                return Ok(existing.clone());
            }
            return Err(ShardingError::AlreadySharded(ns.to_string()).into());
        }
        let chunks = match presplit_chunks_per_shard {
            Some(per_shard) => {
                let shards: Vec<ShardId> = st
                    .shards
                    .values()
                    .filter(|s| !s.draining)
                    .map(|s| s.id)
                    .collect();
                ChunkMap::presplit_hashed(ns.clone(), key_pattern.clone(), &shards, per_shard)?
            }
            None => ChunkMap::single(ns.clone(), key_pattern.clone(), db.primary),
        };
        let routing = CollectionRouting {
            entry: CollectionEntry {
                ns: ns.clone(),
                uuid,
                key_pattern,
                unique,
                resharding: false,
            },
            chunks,
        };
        self.persist(vec![CatalogWrite::put(COLLECTIONS, ns.to_string(), &routing)?])?;
        st.collections.insert(ns.clone(), routing.clone());
        tracing::info!(
            ns = %ns,
            key = %routing.entry.key_pattern,
            chunks = routing.chunks.len(),
            epoch = %routing.epoch(),
            "collection sharded"
        );
        Ok(routing)
    }

    pub fn drop_collection(&self, ns: &Namespace) -> KestrelResult<Option<CollectionRouting>> {
        let mut st = self.state.lock();
        let Some(existing) = st.collections.get(ns).cloned() else {
            return Ok(None);
        };
        self.persist(vec![CatalogWrite::delete(COLLECTIONS, ns.to_string())])?;
        st.collections.remove(ns);
        tracing::info!(ns = %ns, "sharded collection dropped");
        Ok(Some(existing))
    }

    /// Everything a cache holding `since` needs to catch up.
    pub fn routing_since(&self, ns: &Namespace, since: Option<ChunkVersion>) -> RoutingUpdate {
        let st = self.state.lock();
        let Some(c) = st.collections.get(ns) else {
            return RoutingUpdate::NotSharded;
        };
        match since {
            Some(v) if v.epoch == c.epoch() => RoutingUpdate::Incremental {
                entry: c.entry.clone(),
                changed: c.chunks.changed_since(&v),
                collection_version: c.version(),
            },
            _ => RoutingUpdate::Full(c.clone()),
        }
    }

    fn update_chunks<R>(
        &self,
        ns: &Namespace,
        f: impl FnOnce(&mut CollectionRouting) -> KestrelResult<R>,
    ) -> KestrelResult<R> {
        let mut st = self.state.lock();
        let mut routing = Self::require_collection(&st, ns)?;
        let out = f(&mut routing)?;
        routing.chunks.validate()?;
        self.persist(vec![CatalogWrite::put(COLLECTIONS, ns.to_string(), &routing)?])?;
        st.collections.insert(ns.clone(), routing);
        Ok(out)
    }

    pub fn split_chunk(&self, ns: &Namespace, at: &ShardKey) -> KestrelResult<(Chunk, Chunk)> {
        let out = self.update_chunks(ns, |r| r.chunks.split(at))?;
        tracing::debug!(ns = %ns, at = %at, "chunk split");
        Ok(out)
    }

    pub fn merge_chunks(&self, ns: &Namespace, range: &KeyRange) -> KestrelResult<Chunk> {
        self.update_chunks(ns, |r| r.chunks.merge(range))
    }

    pub fn mark_jumbo(&self, ns: &Namespace, range: &KeyRange) -> KestrelResult<()> {
        self.update_chunks(ns, |r| r.chunks.mark_jumbo(range))
    }

    /// Reassign a chunk from `donor` to `recipient`. Returns the moved
    /// chunk's version and the donor's new shard version. Committing the
    /// same move twice reports the already-committed versions.
    pub fn commit_chunk_migration(
        &self,
        ns: &Namespace,
        epoch: Epoch,
        range: &KeyRange,
        donor: ShardId,
        recipient: ShardId,
    ) -> KestrelResult<(ChunkVersion, ChunkVersion)> {
        {
            let st = self.state.lock();
            Self::require_active_shard(&st, recipient)?;
        }
        let out = self.update_chunks(ns, |r| {
            if r.epoch() != epoch {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "{ns} changed epoch from {epoch} to {} during migration",
                    r.epoch()
                ))
                .into());
            }
            let chunk = r.chunks.chunk_with_range(range).cloned().ok_or_else(|| {
                ShardingError::InvalidChunkOperation(format!("{ns} has no chunk {range}"))
            })?;
            if chunk.shard == recipient {
                return Ok((chunk.version, r.chunks.shard_version(donor)));
            }
            if chunk.shard != donor {
                return Err(ShardingError::InvalidChunkOperation(format!(
                    "chunk {range} is owned by {}, not {donor}",
                    chunk.shard
                ))
                .into());
            }
            r.chunks.move_chunk(range, recipient)
        })?;
        tracing::info!(
            ns = %ns,
            range = %range,
            from = %donor,
            to = %recipient,
            version = %out.0,
            "chunk migration committed"
        );
        Ok(out)
    }

    // ── Resharding ──

    pub fn begin_reshard(&self, ns: &Namespace) -> KestrelResult<CollectionRouting> {
        let fcv = self.state.lock().fcv;
        fcv.check_resharding_allowed()?;
        self.update_chunks(ns, |r| {
            if r.entry.resharding {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "{ns} is already being resharded"
                ))
                .into());
            }
            r.entry.resharding = true;
            Ok(r.clone())
        })
    }

    /// Install the new incarnation: new uuid, key pattern, epoch and chunks.
    pub fn commit_reshard(
        &self,
        ns: &Namespace,
        new_uuid: CollectionUuid,
        key_pattern: ShardKeyPattern,
        placement: Vec<(KeyRange, ShardId)>,
    ) -> KestrelResult<CollectionRouting> {
        let epoch = Epoch::generate();
        let chunks: Vec<Chunk> = placement
            .into_iter()
            .enumerate()
            .map(|(i, (range, shard))| Chunk {
                range,
                shard,
                version: ChunkVersion::new(epoch, 1, i as u32),
                jumbo: false,
            })
            .collect();
        let map = ChunkMap::new(ns.clone(), epoch, key_pattern.clone(), chunks)?;
        self.update_chunks(ns, |r| {
            r.entry.uuid = new_uuid;
            r.entry.key_pattern = key_pattern;
            r.entry.resharding = false;
            r.chunks = map;
            Ok(r.clone())
        })
        .inspect(|r| {
            tracing::info!(
                ns = %ns,
                key = %r.entry.key_pattern,
                epoch = %r.epoch(),
                "reshard committed",
            )
        })
    }

    pub fn abort_reshard(&self, ns: &Namespace) -> KestrelResult<()> {
        self.update_chunks(ns, |r| {
            r.entry.resharding = false;
            Ok(())
        })
    }

    // ── Migrations ──

    pub fn persist_migration(&self, doc: MigrationDocument) -> KestrelResult<()> {
        let mut st = self.state.lock();
        self.persist(vec![CatalogWrite::put(MIGRATIONS, doc.id.clone(), &doc)?])?;
        st.migrations.insert(doc.id.clone(), doc);
        Ok(())
    }

    pub fn remove_migration(&self, id: &str) -> KestrelResult<()> {
        let mut st = self.state.lock();
        if st.migrations.contains_key(id) {
            self.persist(vec![CatalogWrite::delete(MIGRATIONS, id)])?;
            st.migrations.remove(id);
        }
        Ok(())
    }

    pub fn migrations_for_donor(&self, donor: ShardId) -> Vec<MigrationDocument> {
        self.state
            .lock()
            .migrations
            .values()
            .filter(|m| m.donor == donor)
            .cloned()
            .collect()
    }

    pub fn active_migrations(&self) -> Vec<MigrationDocument> {
        self.state.lock().migrations.values().cloned().collect()
    }

    // ── Feature compatibility version ──

    pub fn fcv(&self) -> FcvState {
        self.state.lock().fcv
    }

    pub fn begin_fcv_change(&self, target: FeatureVersion) -> KestrelResult<FcvState> {
        let mut st = self.state.lock();
        if target < FeatureVersion::V5_0 && st.collections.values().any(|c| c.entry.resharding) {
            return Err(ShardingError::ConflictingOperationInProgress(
                "cannot downgrade while a reshard is running".into(),
            )
            .into());
        }
        let next = st.fcv.begin_change(target)?;
        self.persist(vec![CatalogWrite::put(VERSION, FCV_DOC, &next)?])?;
        st.fcv = next;
        Ok(next)
    }

    pub fn complete_fcv_change(&self, target: FeatureVersion) -> KestrelResult<FcvState> {
        let mut st = self.state.lock();
        let next = st.fcv.complete_change(target)?;
        self.persist(vec![CatalogWrite::put(VERSION, FCV_DOC, &next)?])?;
        st.fcv = next;
        tracing::info!(fcv = %target, "feature compatibility version set");
        Ok(next)
    }

    // ── Queries used by the balancer and DDL ──

    pub fn databases_on(&self, shard: ShardId) -> Vec<DatabaseEntry> {
        self.state
            .lock()
            .databases
            .values()
            .filter(|d| d.primary == shard)
            .cloned()
            .collect()
    }

    pub fn sharded_in_db(&self, db: &str) -> BTreeSet<Namespace> {
        self.state
            .lock()
            .collections
            .keys()
            .filter(|ns| ns.db == db)
            .cloned()
            .collect()
    }
}

fn load_docs<T: DeserializeOwned>(
    storage: &kestrel_storage::StorageNode,
    coll: &str,
) -> KestrelResult<Vec<T>> {
    durable::load(storage, &Namespace::new("config", coll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::ClusterClock;

    fn catalog() -> Arc<ShardCatalog> {
        let rs = ReplicaSet::new(
            "config",
            3,
            ClusterClock::system(),
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let c = ShardCatalog::open(rs).unwrap();
        c.add_shard(ShardId(0)).unwrap();
        c.add_shard(ShardId(1)).unwrap();
        c
    }

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[test]
    fn test_create_database_balances_primaries() {
        let c = catalog();
        let a = c.create_database("a", None).unwrap();
        let b = c.create_database("b", None).unwrap();
        assert_ne!(a.primary, b.primary);
        assert_eq!(c.create_database("a", None).unwrap(), a);
        assert!(c.create_database("config", None).is_err());
    }

    #[test]
    fn test_catalog_survives_config_failover() {
        let c = catalog();
        c.create_database("shop", Some(ShardId(0))).unwrap();
        c.shard_collection(
            &ns(),
            CollectionUuid::generate(),
            ShardKeyPattern::ranged(&["k"]),
            false,
            None,
        )
            .unwrap();
        c.split_chunk(&ns(), &ShardKey::single(100)).unwrap();
        let before = c.get_collection(&ns()).unwrap();

        let rs = Arc::clone(c.replica_set());
        rs.crash(rs.primary().unwrap().id()).unwrap();
        rs.step_up_best().unwrap();
        c.reload_if_term_changed().unwrap();

        assert_eq!(c.get_collection(&ns()).unwrap(), before);
        assert_eq!(c.list_shards().len(), 2);
        assert_eq!(c.get_database("shop").unwrap().primary, ShardId(0));
    }

    #[test]
    fn test_routing_since_incremental_and_full() {
        let c = catalog();
        c.create_database("shop", Some(ShardId(0))).unwrap();
        let r = c
            .shard_collection(
                &ns(),
                CollectionUuid::generate(),
                ShardKeyPattern::ranged(&["k"]),
                false,
                None,
            )
            .unwrap();
        let v0 = r.version();
        c.split_chunk(&ns(), &ShardKey::single(5)).unwrap();
        match c.routing_since(&ns(), Some(v0)) {
            RoutingUpdate::Incremental { changed, .. } => assert_eq!(changed.len(), 2),
            other => panic!("expected incremental, got {other:?}"),
        }
        let foreign = ChunkVersion::new(Epoch::generate(), 9, 9);
        assert!(matches!(c.routing_since(&ns(), Some(foreign)), RoutingUpdate::Full(_)));
        assert_eq!(
            c.routing_since(&Namespace::new("shop", "other"), None),
            RoutingUpdate::NotSharded
        );
    }

    #[test]
    fn test_commit_migration_is_idempotent() {
        let c = catalog();
        c.create_database("shop", Some(ShardId(0))).unwrap();
        let r = c
            .shard_collection(
                &ns(),
                CollectionUuid::generate(),
                ShardKeyPattern::ranged(&["k"]),
                false,
                None,
            )
            .unwrap();
        let full = r.chunks.pattern().full_range();
        let first = c
            .commit_chunk_migration(&ns(), r.epoch(), &full, ShardId(0), ShardId(1))
            .unwrap();
        let again = c
            .commit_chunk_migration(&ns(), r.epoch(), &full, ShardId(0), ShardId(1))
            .unwrap();
        assert_eq!(first, again);
        let stale_epoch = c.commit_chunk_migration(
            &ns(),
            Epoch::generate(),
            &full,
            ShardId(1),
            ShardId(0),
        );
        assert!(stale_epoch.is_err());
    }

    #[test]
    fn test_remove_shard_drains_then_completes() {
        let c = catalog();
        c.create_database("shop", Some(ShardId(1))).unwrap();
        assert_eq!(c.remove_shard(ShardId(1)).unwrap(), RemoveShardStatus::Started);
        match c.remove_shard(ShardId(1)).unwrap() {
            RemoveShardStatus::Ongoing { databases, .. } => assert_eq!(
                databases,
                vec!["shop".to_string()],
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.remove_shard(ShardId(0)).is_err(), "last active shard");
        c.commit_move_primary("shop", ShardId(0)).unwrap();
        assert_eq!(c.remove_shard(ShardId(1)).unwrap(), RemoveShardStatus::Completed);
        assert_eq!(c.list_shards().len(), 1);
    }

    #[test]
    fn test_reshard_requires_fcv_5() {
        let c = catalog();
        c.create_database("shop", Some(ShardId(0))).unwrap();
        c.shard_collection(
            &ns(),
            CollectionUuid::generate(),
            ShardKeyPattern::ranged(&["k"]),
            false,
            None,
        )
            .unwrap();
        c.begin_fcv_change(FeatureVersion::V4_4).unwrap();
        assert!(c.begin_reshard(&ns()).is_err());
        c.complete_fcv_change(FeatureVersion::V4_4).unwrap();
        assert!(c.begin_reshard(&ns()).is_err());
        c.begin_fcv_change(FeatureVersion::V5_0).unwrap();
        c.complete_fcv_change(FeatureVersion::V5_0).unwrap();
        let r = c.begin_reshard(&ns()).unwrap();
        assert!(r.entry.resharding);
        let new_key = ShardKeyPattern::ranged(&["other"]);
        let committed = c
            .commit_reshard(
                &ns(),
                CollectionUuid::generate(),
                new_key.clone(),
                vec![(new_key.full_range(), ShardId(1))],
            )
            .unwrap();
        assert_ne!(committed.epoch(), r.epoch());
        assert!(!committed.entry.resharding);
    }
}
