//! The shard's cached view of the catalog: which collections are sharded,
//! which chunks it owns, and which databases it is primary for.
//!
//! This cache is the filtering metadata every read and write is checked
//! against. It is refreshed from the config server on demand; the shard
//! never trusts a router's claim that it owns something it has not itself
//! confirmed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use kestrel_common::error::ShardingError;
use kestrel_common::{ChunkVersion, Document, KestrelResult, Namespace, ShardId, ShardKey};

use crate::catalog::{CollectionRouting, DatabaseEntry, RoutingUpdate};

#[derive(Debug, Clone)]
pub enum CollectionFilter {
    Unsharded,
    Sharded(Arc<CollectionRouting>),
}

impl CollectionFilter {
    pub fn routing(&self) -> Option<&CollectionRouting> {
        match self {
            CollectionFilter::Unsharded => None,
            CollectionFilter::Sharded(r) => Some(r),
        }
    }

    /// Unsharded collections own every document; sharded ones only those
    /// whose key falls in a chunk placed on `shard`.
    pub fn owns_key(&self, shard: ShardId, key: &ShardKey) -> bool {
        match self {
            CollectionFilter::Unsharded => true,
            CollectionFilter::Sharded(r) => r.chunks.owner(key) == Some(shard),
        }
    }

    pub fn owns_doc(&self, shard: ShardId, doc: &Document) -> bool {
        match self {
            CollectionFilter::Unsharded => true,
            CollectionFilter::Sharded(r) => r
                .entry
                .key_pattern
                .extract(doc)
                .is_some_and(|k| r.chunks.owner(&k) == Some(shard)),
        }
    }

    pub fn shard_key_of(&self, doc: &Document) -> Option<ShardKey> {
        self.routing().and_then(|r| r.entry.key_pattern.extract(doc))
    }

    pub fn shard_version(&self, shard: ShardId) -> Option<ChunkVersion> {
        self.routing().map(|r| r.chunks.shard_version(shard))
    }
}

#[derive(Debug)]
pub struct ShardMetadata {
    shard: ShardId,
    collections: RwLock<HashMap<Namespace, CollectionFilter>>,
    databases: RwLock<HashMap<String, DatabaseEntry>>,
    refreshes: AtomicU64,
}

impl ShardMetadata {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            collections: RwLock::new(HashMap::new()),
            databases: RwLock::new(HashMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn collection(&self, ns: &Namespace) -> Option<CollectionFilter> {
        self.collections.read().get(ns).cloned()
    }

    /// Merge a catalog answer into the cache. Fails when an incremental
    /// update cannot be spliced into what is cached; the caller then asks
    /// for the full table.
    pub fn install_collection(
        &self,
        ns: &Namespace,
        update: RoutingUpdate,
    ) -> KestrelResult<CollectionFilter> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let filter = match update {
            RoutingUpdate::NotSharded => CollectionFilter::Unsharded,
            RoutingUpdate::Full(r) => CollectionFilter::Sharded(Arc::new(r)),
            RoutingUpdate::Incremental {
                entry,
                changed,
                collection_version,
            } => {
                let cached = match self.collection(ns) {
                    Some(CollectionFilter::Sharded(r))
                        if r.epoch() == collection_version.epoch =>
                    {
                        r
                    }
                    _ => {
                        return Err(ShardingError::StaleConfig {
                            ns: ns.to_string(),
                            shard: self.shard,
                            received: None,
                            wanted: Some(collection_version),
                        }
                        .into())
                    }
                };
                let mut next = (*cached).clone();
                next.entry = entry;
                next.chunks.apply_changes(changed)?;
                CollectionFilter::Sharded(Arc::new(next))
            }
        };
        if let CollectionFilter::Sharded(r) = &filter {
            tracing::debug!(
                shard = %self.shard,
                ns = %ns,
                shard_version = %r.chunks.shard_version(self.shard),
                "filtering metadata refreshed"
            );
        }
        self.collections.write().insert(ns.clone(), filter.clone());
        Ok(filter)
    }

    /// Whether `filter` is still the cached entry for `ns`. A refresh or a
    /// migration's critical-section exit replaces or drops the entry, so a
    /// filter checked before taking the write lock must be revalidated here.
    pub fn is_current(&self, ns: &Namespace, filter: &CollectionFilter) -> bool {
        match (self.collections.read().get(ns), filter) {
            (Some(CollectionFilter::Unsharded), CollectionFilter::Unsharded) => true,
            (Some(CollectionFilter::Sharded(cached)), CollectionFilter::Sharded(seen)) => {
                Arc::ptr_eq(cached, seen)
            }
            _ => false,
        }
    }

    pub fn forget_collection(&self, ns: &Namespace) {
        self.collections.write().remove(ns);
    }

    pub fn forget_database(&self, db: &str) {
        self.databases.write().remove(db);
        self.collections.write().retain(|ns, _| ns.db != db);
    }

    pub fn database(&self, db: &str) -> Option<DatabaseEntry> {
        self.databases.read().get(db).cloned()
    }

    pub fn install_database(&self, db: &str, entry: Option<DatabaseEntry>) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let mut dbs = self.databases.write();
        match entry {
            Some(e) => {
                dbs.insert(db.to_string(), e);
            }
            None => {
                dbs.remove(db);
            }
        }
    }

    /// Shard key of `doc` under the cached pattern of `ns`, if sharded.
    pub fn shard_key_of(&self, ns: &Namespace, doc: &Document) -> Option<ShardKey> {
        self.collections
            .read()
            .get(ns)
            .and_then(|f| f.shard_key_of(doc))
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChunkMap, CollectionEntry};
    use kestrel_common::{CollectionUuid, KeyValue, ShardKeyPattern};
    use serde_json::json;

    fn routing(ns: &Namespace) -> CollectionRouting {
        let pattern = ShardKeyPattern::ranged(&["k"]);
        let mut chunks = ChunkMap::single(ns.clone(), pattern.clone(), ShardId(0));
        chunks.split(&ShardKey::single(KeyValue::Int(10))).unwrap();
        CollectionRouting {
            entry: CollectionEntry {
                ns: ns.clone(),
                uuid: CollectionUuid::generate(),
                key_pattern: pattern,
                unique: false,
                resharding: false,
            },
            chunks,
        }
    }

    #[test]
    fn test_incremental_update_splices_moved_chunk() {
        let ns = Namespace::new("app", "users");
        let md = ShardMetadata::new(ShardId(0));
        let r = routing(&ns);
        let since = r.version();
        md.install_collection(&ns, RoutingUpdate::Full(r.clone())).unwrap();

        let mut moved = r.clone();
        let upper = moved.chunks.chunks()[1].range.clone();
        moved.chunks.move_chunk(&upper, ShardId(1)).unwrap();
        let update = RoutingUpdate::Incremental {
            entry: moved.entry.clone(),
            changed: moved.chunks.changed_since(&since),
            collection_version: moved.version(),
        };
        let f = md.install_collection(&ns, update).unwrap();
        let high = json!({"_id": 1, "k": 50}).as_object().cloned().unwrap();
        let low = json!({"_id": 2, "k": 5}).as_object().cloned().unwrap();
        assert!(!f.owns_doc(ShardId(0), &high));
        assert!(f.owns_doc(ShardId(1), &high));
        assert!(f.owns_doc(ShardId(0), &low));
    }

    #[test]
    fn test_filter_goes_stale_after_forget_or_refresh() {
        let ns = Namespace::new("app", "users");
        let md = ShardMetadata::new(ShardId(0));
        let r = routing(&ns);
        let seen = md.install_collection(&ns, RoutingUpdate::Full(r.clone())).unwrap();
        assert!(md.is_current(&ns, &seen));

        let refreshed = md.install_collection(&ns, RoutingUpdate::Full(r)).unwrap();
        assert!(!md.is_current(&ns, &seen));
        assert!(md.is_current(&ns, &refreshed));

        md.forget_collection(&ns);
        assert!(!md.is_current(&ns, &refreshed));

        let other = Namespace::new("app", "notes");
        let unsharded = md.install_collection(&other, RoutingUpdate::NotSharded).unwrap();
        assert!(md.is_current(&other, &unsharded));
        md.forget_database("app");
        assert!(!md.is_current(&other, &unsharded));
    }

    #[test]
    fn test_incremental_without_cache_asks_for_full_refresh() {
        let ns = Namespace::new("app", "users");
        let md = ShardMetadata::new(ShardId(0));
        let r = routing(&ns);
        let err = md
            .install_collection(
                &ns,
                RoutingUpdate::Incremental {
                    entry: r.entry.clone(),
                    changed: vec![],
                    collection_version: r.version(),
                },
            )
            .unwrap_err();
        assert!(err.is_stale());
    }
}
