//! Turning client write statements into single-document oplog operations.
//!
//! Planning is the same whether the statement runs on its own or inside a
//! transaction; only the view of the data differs. Ordinary writes plan
//! against the latest committed state while holding the replica set's
//! write lock. Transaction writes plan against their snapshot overlaid
//! with their own earlier writes.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use kestrel_common::error::ShardingError;
use kestrel_common::{
    DocKey, Document, Filter, KestrelError, KestrelResult, KeyValue, LogicalTimestamp, Namespace,
    ShardId, UpdateSpec,
};
use kestrel_repl::{CrudOp, StmtOutcome};
use kestrel_storage::StorageNode;

use super::metadata::CollectionFilter;
use crate::messages::WriteOp;

/// Documents visible to a statement.
pub(crate) trait DocSource {
    fn get(&self, ns: &Namespace, id: &DocKey) -> KestrelResult<Option<Document>>;
    fn find(
        &self,
        ns: &Namespace,
        pred: &dyn Fn(&Document) -> bool,
    ) -> KestrelResult<Vec<Document>>;
}

pub(crate) struct LatestSource<'a>(pub &'a StorageNode);

impl DocSource for LatestSource<'_> {
    fn get(&self, ns: &Namespace, id: &DocKey) -> KestrelResult<Option<Document>> {
        Ok(self.0.get_latest(ns, id))
    }

    fn find(
        &self,
        ns: &Namespace,
        pred: &dyn Fn(&Document) -> bool,
    ) -> KestrelResult<Vec<Document>> {
        Ok(self.0.scan_latest_where(ns, |d| pred(d)))
    }
}

/// A transaction's view: its snapshot plus its own uncommitted writes.
pub(crate) struct SnapshotSource<'a> {
    pub storage: &'a StorageNode,
    pub read_ts: LogicalTimestamp,
    pub overlay: &'a BTreeMap<(Namespace, DocKey), Option<Document>>,
}

impl DocSource for SnapshotSource<'_> {
    fn get(&self, ns: &Namespace, id: &DocKey) -> KestrelResult<Option<Document>> {
        if let Some(own) = self.overlay.get(&(ns.clone(), id.clone())) {
            return Ok(own.clone());
        }
        self.storage.get(ns, id, self.read_ts)
    }

    fn find(
        &self,
        ns: &Namespace,
        pred: &dyn Fn(&Document) -> bool,
    ) -> KestrelResult<Vec<Document>> {
        let mut out: BTreeMap<DocKey, Document> = BTreeMap::new();
        for doc in self.storage.scan_where(ns, self.read_ts, |d| pred(d))? {
            let id = DocKey::of(&doc)?;
            if !self.overlay.contains_key(&(ns.clone(), id.clone())) {
                out.insert(id, doc);
            }
        }
        for ((n, id), doc) in self.overlay {
            if n != ns {
                continue;
            }
            if let Some(doc) = doc {
                if pred(doc) {
                    out.insert(id.clone(), doc.clone());
                }
            }
        }
        Ok(out.into_values().collect())
    }
}

/// Where a statement runs: which collection, on which shard, under which
/// ownership metadata.
pub(crate) struct WriteContext<'a> {
    pub ns: &'a Namespace,
    pub shard: ShardId,
    pub filter: &'a CollectionFilter,
}

impl WriteContext<'_> {
    fn owned(&self, doc: &Document) -> bool {
        self.filter.owns_doc(self.shard, doc)
    }

    /// A document routed here that this shard does not own means the sender
    /// and this shard disagree about placement.
    fn require_owned(&self, doc: &Document) -> KestrelResult<()> {
        let Some(routing) = self.filter.routing() else {
            return Ok(());
        };
        let key = routing.entry.key_pattern.extract(doc).ok_or_else(|| {
            KestrelError::BadValue(format!(
                "document has an invalid value for shard key {}",
                routing.entry.key_pattern
            ))
        })?;
        if routing.chunks.owner(&key) == Some(self.shard) {
            return Ok(());
        }
        Err(ShardingError::StaleConfig {
            ns: self.ns.to_string(),
            shard: self.shard,
            received: None,
            wanted: Some(routing.chunks.shard_version(self.shard)),
        }
        .into())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PlannedWrite {
    pub ops: Vec<CrudOp>,
    pub outcome: StmtOutcome,
    pub upserted: Option<KeyValue>,
}

pub(crate) fn plan_write(
    ctx: &WriteContext<'_>,
    op: &WriteOp,
    source: &dyn DocSource,
) -> KestrelResult<PlannedWrite> {
    match op {
        WriteOp::Insert { doc } => plan_insert(ctx, doc.clone(), source),
        WriteOp::Update {
            filter,
            update,
            upsert,
            multi,
        } => plan_update(ctx, filter, update, *upsert, *multi, source),
        WriteOp::Delete { filter, multi } => plan_delete(ctx, filter, *multi, source),
    }
}

fn plan_insert(
    ctx: &WriteContext<'_>,
    doc: Document,
    source: &dyn DocSource,
) -> KestrelResult<PlannedWrite> {
    let id = DocKey::of(&doc)?;
    ctx.require_owned(&doc)?;
    if source.get(ctx.ns, &id)?.is_some() {
        return Err(KestrelError::DuplicateKey {
            ns: ctx.ns.to_string(),
            key: id.to_string(),
        });
    }
    Ok(PlannedWrite {
        ops: vec![CrudOp::Insert { doc }],
        outcome: StmtOutcome { n: 1, n_modified: 0 },
        upserted: None,
    })
}

fn matching(
    ctx: &WriteContext<'_>,
    filter: &Filter,
    multi: bool,
    source: &dyn DocSource,
) -> KestrelResult<Vec<Document>> {
    let mut docs = source.find(ctx.ns, &|d| filter.matches(d) && ctx.owned(d))?;
    if !multi {
        docs.truncate(1);
    }
    Ok(docs)
}

fn plan_update(
    ctx: &WriteContext<'_>,
    filter: &Filter,
    update: &UpdateSpec,
    upsert: bool,
    multi: bool,
    source: &dyn DocSource,
) -> KestrelResult<PlannedWrite> {
    let docs = matching(ctx, filter, multi, source)?;
    if docs.is_empty() && upsert {
        return plan_upsert(ctx, filter, update, source);
    }
    let mut plan = PlannedWrite::default();
    for pre in docs {
        let out = update.apply(&pre)?;
        if let Some(routing) = ctx.filter.routing() {
            let pattern = &routing.entry.key_pattern;
            if pattern.extract(&pre) != pattern.extract(&out.post_image) {
                return Err(KestrelError::ImmutableField(pattern.fields.join(", ")));
            }
        }
        plan.outcome.n += 1;
        if out.post_image == pre {
            continue;
        }
        plan.outcome.n_modified += 1;
        plan.ops.push(CrudOp::Update {
            doc_key: DocKey::of(&pre)?,
            post_image: out.post_image,
            updated_fields: out.updated_fields,
            removed_fields: out.removed_fields,
            is_replacement: out.is_replacement,
        });
    }
    Ok(plan)
}

fn plan_upsert(
    ctx: &WriteContext<'_>,
    filter: &Filter,
    update: &UpdateSpec,
    source: &dyn DocSource,
) -> KestrelResult<PlannedWrite> {
    let seed = filter.equality_seed()?;
    let mut doc = match update {
        UpdateSpec::Replace(replacement) => {
            let mut d = replacement.clone();
            if let (None, Some(id)) = (d.get("_id"), seed.get("_id")) {
                d.insert("_id".into(), id.clone());
            }
            d
        }
        UpdateSpec::Modifiers { .. } => update.apply(&seed)?.post_image,
    };
    if !doc.contains_key("_id") {
        doc.insert("_id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    let mut plan = plan_insert(ctx, doc, source)?;
    plan.upserted = plan
        .ops
        .first()
        .and_then(|op| op.doc_key().ok())
        .map(|k| k.0);
    Ok(plan)
}

fn plan_delete(
    ctx: &WriteContext<'_>,
    filter: &Filter,
    multi: bool,
    source: &dyn DocSource,
) -> KestrelResult<PlannedWrite> {
    let mut plan = PlannedWrite::default();
    for doc in matching(ctx, filter, multi, source)? {
        plan.ops.push(CrudOp::Delete {
            doc_key: DocKey::of(&doc)?,
        });
        plan.outcome.n += 1;
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{ChunkMap, CollectionEntry, CollectionRouting};
    use kestrel_common::{CollectionUuid, ShardKey, ShardKeyPattern};
    use kestrel_storage::CollectionOptions;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (Arc<StorageNode>, Namespace) {
        let s = StorageNode::new("t");
        let ns = Namespace::new("app", "users");
        s.create_collection(
            &ns,
            CollectionUuid::generate(),
            CollectionOptions::default(),
            LogicalTimestamp::new(1, 0),
        )
        .unwrap();
        s.put(&ns, doc(json!({"_id": 1, "k": 1, "n": 0})), LogicalTimestamp::new(1, 1))
            .unwrap();
        s.put(&ns, doc(json!({"_id": 2, "k": 20, "n": 0})), LogicalTimestamp::new(1, 2))
            .unwrap();
        (s, ns)
    }

    fn sharded(ns: &Namespace) -> CollectionFilter {
        let pattern = ShardKeyPattern::ranged(&["k"]);
        let mut chunks = ChunkMap::single(ns.clone(), pattern.clone(), ShardId(0));
        let (_, upper) = chunks.split(&ShardKey::single(10)).unwrap();
        chunks.move_chunk(&upper.range, ShardId(1)).unwrap();
        CollectionFilter::Sharded(Arc::new(CollectionRouting {
            entry: CollectionEntry {
                ns: ns.clone(),
                uuid: CollectionUuid::generate(),
                key_pattern: pattern,
                unique: false,
                resharding: false,
            },
            chunks,
        }))
    }

    #[test]
    fn test_multi_update_skips_orphans_and_counts_unmodified() {
        let (s, ns) = setup();
        let filter = sharded(&ns);
        let ctx = WriteContext {
            ns: &ns,
            shard: ShardId(0),
            filter: &filter,
        };
        let op = WriteOp::Update {
            filter: Filter::all(),
            update: UpdateSpec::parse(&json!({"$set": {"n": 0}})).unwrap(),
            upsert: false,
            multi: true,
        };
        let plan = plan_write(&ctx, &op, &LatestSource(&s)).unwrap();
        assert_eq!(plan.outcome, StmtOutcome { n: 1, n_modified: 0 });
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn test_shard_key_change_is_rejected() {
        let (s, ns) = setup();
        let filter = sharded(&ns);
        let ctx = WriteContext {
            ns: &ns,
            shard: ShardId(0),
            filter: &filter,
        };
        let op = WriteOp::Update {
            filter: Filter::by_id(&KeyValue::Int(1)),
            update: UpdateSpec::parse(&json!({"$set": {"k": 2}})).unwrap(),
            upsert: false,
            multi: false,
        };
        let err = plan_write(&ctx, &op, &LatestSource(&s)).unwrap_err();
        assert!(matches!(err, KestrelError::ImmutableField(_)));
    }

    #[test]
    fn test_upsert_seeds_from_equalities_and_checks_ownership() {
        let (s, ns) = setup();
        let filter = sharded(&ns);
        let ctx = WriteContext {
            ns: &ns,
            shard: ShardId(0),
            filter: &filter,
        };
        let op = WriteOp::Update {
            filter: Filter::eq("k", json!(5)).and("_id", kestrel_common::Condition::Eq(json!(9))),
            update: UpdateSpec::parse(&json!({"$inc": {"n": 1}})).unwrap(),
            upsert: true,
            multi: false,
        };
        let plan = plan_write(&ctx, &op, &LatestSource(&s)).unwrap();
        assert_eq!(plan.upserted, Some(KeyValue::Int(9)));
        assert_eq!(
            plan.ops[0].post_image().cloned(),
            Some(doc(json!({"_id": 9, "k": 5, "n": 1})))
        );

        let elsewhere = WriteOp::Insert {
            doc: doc(json!({"_id": 3, "k": 50})),
        };
        let err = plan_write(&ctx, &elsewhere, &LatestSource(&s)).unwrap_err();
        assert!(err.is_stale());
    }

    #[test]
    fn test_snapshot_source_overlays_own_writes() {
        let (s, ns) = setup();
        let mut overlay = BTreeMap::new();
        overlay.insert((ns.clone(), DocKey(KeyValue::Int(1))), None);
        overlay.insert(
            (ns.clone(), DocKey(KeyValue::Int(7))),
            Some(doc(json!({"_id": 7, "k": 7}))),
        );
        let src = SnapshotSource {
            storage: &s,
            read_ts: LogicalTimestamp::new(2, 0),
            overlay: &overlay,
        };
        let ids: Vec<_> = src
            .find(&ns, &|_| true)
            .unwrap()
            .iter()
            .map(|d| d["_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(2), json!(7)]);
        assert!(src.get(&ns, &DocKey(KeyValue::Int(1))).unwrap().is_none());
    }
}
