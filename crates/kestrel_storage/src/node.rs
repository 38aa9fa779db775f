//! Multi-version storage node.
//!
//! Holds one replica's copy of every collection as timestamped version chains.
//! Readers pick a timestamp; history older than the oldest retained timestamp
//! is pruned and reads below it fail with `SnapshotUnavailable`. Collections
//! with pre-images enabled record the document image each write replaced.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use kestrel_common::error::StorageError;
use kestrel_common::{
    CollectionUuid, DocKey, Document, KestrelError, KestrelResult, KeyValue, LogicalTimestamp,
    Namespace,
};

use crate::mvcc::VersionChain;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Record pre-images of updated/deleted documents for change streams.
    pub pre_images: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub options: CollectionOptions,
    pub created_at: LogicalTimestamp,
}

struct Collection {
    info: CollectionInfo,
    docs: BTreeMap<KeyValue, VersionChain>,
}

impl Collection {
    fn visible_docs(&self, ts: LogicalTimestamp) -> impl Iterator<Item = &Document> {
        self.docs.values().filter_map(move |c| c.read_at(ts))
    }
}

#[derive(Debug, Default)]
struct StorageMetrics {
    writes: AtomicU64,
    reads: AtomicU64,
    pruned_versions: AtomicU64,
    snapshot_too_old: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub collections: usize,
    pub live_docs: usize,
    pub pre_images: usize,
    pub writes: u64,
    pub reads: u64,
    pub pruned_versions: u64,
    pub snapshot_too_old: u64,
    pub oldest_timestamp: LogicalTimestamp,
}

/// Pre-images keyed by collection incarnation, write timestamp and document id.
type PreImageKey = (CollectionUuid, LogicalTimestamp, KeyValue);

pub struct StorageNode {
    name: String,
    collections: RwLock<HashMap<Namespace, Collection>>,
    pre_images: RwLock<BTreeMap<PreImageKey, Document>>,
    oldest: RwLock<LogicalTimestamp>,
    metrics: StorageMetrics,
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode").field("name", &self.name).finish()
    }
}

impl StorageNode {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            collections: RwLock::new(HashMap::new()),
            pre_images: RwLock::new(BTreeMap::new()),
            oldest: RwLock::new(LogicalTimestamp::MIN),
            metrics: StorageMetrics::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Collections ──

    /// Create a collection. Re-creating with the same uuid is a no-op so that
    /// oplog application stays idempotent.
    pub fn create_collection(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        options: CollectionOptions,
        ts: LogicalTimestamp,
    ) -> KestrelResult<()> {
        let mut colls = self.collections.write();
        if let Some(existing) = colls.get(ns) {
            if existing.info.uuid == uuid {
                return Ok(());
            }
            return Err(StorageError::CollectionExists(ns.to_string()).into());
        }
        colls.insert(
            ns.clone(),
            Collection {
                info: CollectionInfo {
                    ns: ns.clone(),
                    uuid,
                    options,
                    created_at: ts,
                },
                docs: BTreeMap::new(),
            },
        );
        tracing::debug!(node = %self.name, %ns, %uuid, "collection created");
        Ok(())
    }

    /// Physically remove a collection and all of its history.
    pub fn drop_collection(&self, ns: &Namespace) -> Option<CollectionInfo> {
        let removed = self.collections.write().remove(ns)?;
        let uuid = removed.info.uuid;
        self.pre_images.write().retain(|(u, _, _), _| *u != uuid);
        tracing::debug!(node = %self.name, %ns, "collection dropped");
        Some(removed.info)
    }

    pub fn collection_info(&self, ns: &Namespace) -> Option<CollectionInfo> {
        self.collections.read().get(ns).map(|c| c.info.clone())
    }

    pub fn set_collection_options(
        &self,
        ns: &Namespace,
        options: CollectionOptions,
    ) -> KestrelResult<()> {
        let mut colls = self.collections.write();
        let coll = colls
            .get_mut(ns)
            .ok_or_else(|| StorageError::CollectionNotFound(ns.to_string()))?;
        coll.info.options = options;
        Ok(())
    }

    pub fn list_collections(&self) -> Vec<CollectionInfo> {
        let mut out: Vec<_> = self
            .collections
            .read()
            .values()
            .map(|c| c.info.clone())
            .collect();
        out.sort_by(|a, b| a.ns.cmp(&b.ns));
        out
    }

    // ── Writes ──

    /// Install `doc` (or a tombstone) for `id` at `ts`. Returns the image the
    /// write replaced, as seen immediately before `ts`.
    pub fn write(
        &self,
        ns: &Namespace,
        id: &DocKey,
        doc: Option<Document>,
        ts: LogicalTimestamp,
    ) -> KestrelResult<Option<Document>> {
        let mut colls = self.collections.write();
        let coll = colls
            .get_mut(ns)
            .ok_or_else(|| StorageError::CollectionNotFound(ns.to_string()))?;
        let chain = coll.docs.entry(id.0.clone()).or_default();
        let before = chain.read_at(ts.prev()).cloned();
        chain.write(ts, doc);
        if coll.info.options.pre_images {
            if let Some(pre) = &before {
                self.pre_images
                    .write()
                    .insert((coll.info.uuid, ts, id.0.clone()), pre.clone());
            }
        }
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        Ok(before)
    }

    pub fn put(
        &self,
        ns: &Namespace,
        doc: Document,
        ts: LogicalTimestamp,
    ) -> KestrelResult<Option<Document>> {
        let id = DocKey::of(&doc)?;
        self.write(ns, &id, Some(doc), ts)
    }

    pub fn delete(
        &self,
        ns: &Namespace,
        id: &DocKey,
        ts: LogicalTimestamp,
    ) -> KestrelResult<Option<Document>> {
        self.write(ns, id, None, ts)
    }

    // ── Reads ──

    fn check_snapshot(&self, read_ts: LogicalTimestamp) -> KestrelResult<()> {
        let oldest = *self.oldest.read();
        if read_ts < oldest {
            self.metrics.snapshot_too_old.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::SnapshotUnavailable {
                requested: read_ts,
                oldest,
            }
            .into());
        }
        Ok(())
    }

    pub fn get(
        &self,
        ns: &Namespace,
        id: &DocKey,
        read_ts: LogicalTimestamp,
    ) -> KestrelResult<Option<Document>> {
        self.check_snapshot(read_ts)?;
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        let colls = self.collections.read();
        Ok(colls
            .get(ns)
            .and_then(|c| c.docs.get(&id.0))
            .and_then(|chain| chain.read_at(read_ts).cloned()))
    }

    pub fn get_latest(&self, ns: &Namespace, id: &DocKey) -> Option<Document> {
        let colls = self.collections.read();
        colls
            .get(ns)
            .and_then(|c| c.docs.get(&id.0))
            .and_then(|chain| chain.latest().cloned())
    }

    /// Timestamp of the newest version of `id`, tombstones included.
    pub fn latest_write_ts(&self, ns: &Namespace, id: &DocKey) -> Option<LogicalTimestamp> {
        let colls = self.collections.read();
        colls
            .get(ns)
            .and_then(|c| c.docs.get(&id.0))
            .and_then(|chain| chain.latest_ts())
    }

    /// All documents visible at `read_ts`, in `_id` order.
    pub fn scan(&self, ns: &Namespace, read_ts: LogicalTimestamp) -> KestrelResult<Vec<Document>> {
        self.scan_where(ns, read_ts, |_| true)
    }

    pub fn scan_where(
        &self,
        ns: &Namespace,
        read_ts: LogicalTimestamp,
        pred: impl Fn(&Document) -> bool,
    ) -> KestrelResult<Vec<Document>> {
        self.check_snapshot(read_ts)?;
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        let colls = self.collections.read();
        Ok(match colls.get(ns) {
            None => Vec::new(),
            Some(c) => c.visible_docs(read_ts).filter(|d| pred(*d)).cloned().collect(),
        })
    }

    /// Latest documents matching `pred`, regardless of history window.
    pub fn scan_latest_where(
        &self,
        ns: &Namespace,
        pred: impl Fn(&Document) -> bool,
    ) -> Vec<Document> {
        let colls = self.collections.read();
        match colls.get(ns) {
            None => Vec::new(),
            Some(c) => c
                .docs
                .values()
                .filter_map(|chain| chain.latest())
                .filter(|d| pred(*d))
                .cloned()
                .collect(),
        }
    }

    /// Point-in-time handle for repeated reads at one timestamp.
    pub fn snapshot_read(self: &Arc<Self>, ts: LogicalTimestamp) -> KestrelResult<ReadHandle> {
        self.check_snapshot(ts)?;
        Ok(ReadHandle {
            node: Arc::clone(self),
            ts,
        })
    }

    pub fn pre_image(
        &self,
        uuid: CollectionUuid,
        ts: LogicalTimestamp,
        id: &DocKey,
    ) -> Option<Document> {
        self.pre_images.read().get(&(uuid, ts, id.0.clone())).cloned()
    }

    // ── History management ──

    pub fn oldest_timestamp(&self) -> LogicalTimestamp {
        *self.oldest.read()
    }

    /// Advance the oldest readable timestamp and prune history below it.
    /// The oldest timestamp never moves backwards.
    pub fn set_oldest_timestamp(&self, ts: LogicalTimestamp) -> usize {
        {
            let mut oldest = self.oldest.write();
            if ts <= *oldest {
                return 0;
            }
            *oldest = ts;
        }
        let mut pruned = 0;
        let mut colls = self.collections.write();
        for coll in colls.values_mut() {
            for chain in coll.docs.values_mut() {
                pruned += chain.prune(ts);
            }
            coll.docs.retain(|_, chain| !chain.is_dead(ts));
        }
        drop(colls);
        self.pre_images.write().retain(|(_, t, _), _| *t >= ts);
        self.metrics
            .pruned_versions
            .fetch_add(pruned as u64, Ordering::Relaxed);
        pruned
    }

    /// Drop every version written after `ts` (rollback). Returns the ids whose
    /// history changed, per namespace.
    pub fn truncate_after(&self, ts: LogicalTimestamp) -> Vec<(Namespace, DocKey)> {
        let mut touched = Vec::new();
        let mut colls = self.collections.write();
        for (ns, coll) in colls.iter_mut() {
            for (id, chain) in coll.docs.iter_mut() {
                if chain.truncate_after(ts) > 0 {
                    touched.push((ns.clone(), DocKey(id.clone())));
                }
            }
            coll.docs.retain(|_, chain| !chain.is_empty());
        }
        drop(colls);
        self.pre_images.write().retain(|(_, t, _), _| *t <= ts);
        touched
    }

    /// Number of documents visible at the latest version.
    pub fn count_latest(&self, ns: &Namespace) -> usize {
        let colls = self.collections.read();
        colls
            .get(ns)
            .map(|c| c.docs.values().filter(|ch| ch.latest().is_some()).count())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StorageSnapshot {
        let colls = self.collections.read();
        StorageSnapshot {
            collections: colls.len(),
            live_docs: colls
                .values()
                .map(|c| c.docs.values().filter(|ch| ch.latest().is_some()).count())
                .sum(),
            pre_images: self.pre_images.read().len(),
            writes: self.metrics.writes.load(Ordering::Relaxed),
            reads: self.metrics.reads.load(Ordering::Relaxed),
            pruned_versions: self.metrics.pruned_versions.load(Ordering::Relaxed),
            snapshot_too_old: self.metrics.snapshot_too_old.load(Ordering::Relaxed),
            oldest_timestamp: *self.oldest.read(),
        }
    }

    /// Replace this node's contents with a copy of `source` (initial sync).
    pub fn copy_from(&self, source: &StorageNode) {
        let src = source.collections.read();
        let mut dst = self.collections.write();
        dst.clear();
        for (ns, coll) in src.iter() {
            dst.insert(
                ns.clone(),
                Collection {
                    info: coll.info.clone(),
                    docs: coll.docs.clone(),
                },
            );
        }
        *self.pre_images.write() = source.pre_images.read().clone();
        *self.oldest.write() = *source.oldest.read();
    }
}

/// Reads pinned to one timestamp.
#[derive(Debug, Clone)]
pub struct ReadHandle {
    node: Arc<StorageNode>,
    ts: LogicalTimestamp,
}

impl ReadHandle {
    pub fn timestamp(&self) -> LogicalTimestamp {
        self.ts
    }

    pub fn get(&self, ns: &Namespace, id: &DocKey) -> KestrelResult<Option<Document>> {
        self.node.get(ns, id, self.ts)
    }

    pub fn scan(&self, ns: &Namespace) -> KestrelResult<Vec<Document>> {
        self.node.scan(ns, self.ts)
    }

    pub fn scan_where(
        &self,
        ns: &Namespace,
        pred: impl Fn(&Document) -> bool,
    ) -> KestrelResult<Vec<Document>> {
        self.node.scan_where(ns, self.ts, pred)
    }
}

/// Map a missing collection to `NamespaceNotFound` for client-facing paths.
pub fn require_collection(node: &StorageNode, ns: &Namespace) -> KestrelResult<CollectionInfo> {
    node.collection_info(ns)
        .ok_or_else(|| KestrelError::NamespaceNotFound(ns.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn ts(s: u32) -> LogicalTimestamp {
        LogicalTimestamp::new(s, 0)
    }

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn setup(pre_images: bool) -> (Arc<StorageNode>, Namespace) {
        let node = StorageNode::new("n0");
        let ns = Namespace::new("db", "c");
        node.create_collection(
            &ns,
            CollectionUuid::generate(),
            CollectionOptions { pre_images },
            ts(1),
        )
        .unwrap();
        (node, ns)
    }

    #[test]
    fn test_get_at_timestamp() {
        let (node, ns) = setup(false);
        node.put(&ns, doc(json!({"_id": 1, "v": "a"})), ts(10)).unwrap();
        node.put(&ns, doc(json!({"_id": 1, "v": "b"})), ts(20)).unwrap();
        let id = DocKey(KeyValue::Int(1));
        assert!(node.get(&ns, &id, ts(5)).unwrap().is_none());
        assert_eq!(node.get(&ns, &id, ts(15)).unwrap().unwrap()["v"], "a");
        assert_eq!(node.get(&ns, &id, ts(25)).unwrap().unwrap()["v"], "b");
    }

    #[test]
    fn test_snapshot_unavailable_below_oldest() {
        let (node, ns) = setup(false);
        node.put(&ns, doc(json!({"_id": 1})), ts(10)).unwrap();
        node.put(&ns, doc(json!({"_id": 1, "x": 1})), ts(20)).unwrap();
        assert_eq!(node.set_oldest_timestamp(ts(15)), 0);
        assert_eq!(node.set_oldest_timestamp(ts(20)), 1);
        let err = node.get(&ns, &DocKey(KeyValue::Int(1)), ts(12)).unwrap_err();
        assert_eq!(err.code(), 239);
        assert!(node.snapshot_read(ts(12)).is_err());
        let handle = node.snapshot_read(ts(20)).unwrap();
        assert_eq!(handle.scan(&ns).unwrap().len(), 1);
    }

    #[test]
    fn test_pre_images_recorded_when_enabled() {
        let (node, ns) = setup(true);
        let uuid = node.collection_info(&ns).unwrap().uuid;
        node.put(&ns, doc(json!({"_id": 1, "v": 1})), ts(10)).unwrap();
        node.put(&ns, doc(json!({"_id": 1, "v": 2})), ts(11)).unwrap();
        node.delete(&ns, &DocKey(KeyValue::Int(1)), ts(12)).unwrap();
        let id = DocKey(KeyValue::Int(1));
        assert!(node.pre_image(uuid, ts(10), &id).is_none());
        assert_eq!(node.pre_image(uuid, ts(11), &id).unwrap()["v"], 1);
        assert_eq!(node.pre_image(uuid, ts(12), &id).unwrap()["v"], 2);
    }

    #[test]
    fn test_truncate_after_reports_touched_docs() {
        let (node, ns) = setup(false);
        node.put(&ns, doc(json!({"_id": 1})), ts(10)).unwrap();
        node.put(&ns, doc(json!({"_id": 2})), ts(20)).unwrap();
        let touched = node.truncate_after(ts(15));
        assert_eq!(touched, vec![(ns.clone(), DocKey(KeyValue::Int(2)))]);
        assert_eq!(node.count_latest(&ns), 1);
    }

    #[test]
    fn test_create_collection_is_idempotent_per_uuid() {
        let (node, ns) = setup(false);
        let uuid = node.collection_info(&ns).unwrap().uuid;
        node.create_collection(&ns, uuid, CollectionOptions::default(), ts(2))
            .unwrap();
        let err = node
            .create_collection(&ns, CollectionUuid::generate(), CollectionOptions::default(), ts(2))
            .unwrap_err();
        assert_eq!(err.code(), 48);
        assert!(node.drop_collection(&ns).is_some());
        assert!(node.collection_info(&ns).is_none());
    }

    #[test]
    fn test_copy_from_replaces_contents() {
        let (source, ns) = setup(false);
        source.put(&ns, doc(json!({"_id": 1, "v": 1})), ts(10)).unwrap();
        let target = StorageNode::new("n1");
        let stale = Namespace::new("db", "stale");
        target
            .create_collection(
                &stale,
                CollectionUuid::generate(),
                CollectionOptions::default(),
                ts(1),
            )
            .unwrap();

        target.copy_from(&source);
        assert!(target.collection_info(&stale).is_none());
        assert_eq!(target.count_latest(&ns), 1);
        let id = DocKey(KeyValue::Int(1));
        assert_eq!(target.get(&ns, &id, ts(10)).unwrap().unwrap()["v"], 1);
    }
}
