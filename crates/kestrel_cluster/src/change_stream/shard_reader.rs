//! Shard side of a change stream: turns majority-committed oplog entries
//! into change events.
//!
//! Events carry the timestamp of the oplog entry that made them visible, so
//! the writes of a transaction share the cluster time of its commit (or of
//! its single `applyOps` entry) and are ordered by their index inside it.

use kestrel_common::error::ChangeStreamError;
use kestrel_common::{
    CollectionUuid, KestrelResult, LogicalTimestamp, Namespace, ShardId,
};
use kestrel_repl::{CrudOp, OplogEntry, OplogOp, ReplicaSet, TxnInfo, TxnOp};
use kestrel_storage::StorageNode;

use super::event::{ChangeEvent, OperationType, UpdateDescription};
use super::{
    FullDocumentMode, PreImageMode, ResumeToken, ShardChangeBatch, ShardStreamRequest,
    WatchTarget,
};

/// Oplog entries scanned per fetch when the caller sets no limit.
const SCAN_BATCH: usize = 1024;

/// Events after `req.after`, up to this shard's committed watermark.
pub fn read_changes(
    rs: &ReplicaSet,
    shard: ShardId,
    req: &ShardStreamRequest,
) -> KestrelResult<ShardChangeBatch> {
    let from = req.after.cluster_time.prev();
    if !rs.has_history_after(from)? {
        return Err(ChangeStreamError::HistoryLost {
            requested: req.after.cluster_time,
            oldest: rs.oldest_oplog_ts()?.unwrap_or(LogicalTimestamp::MIN),
        }
        .into());
    }
    let primary = rs.primary()?;
    let storage = primary.storage();
    if req.before_change == PreImageMode::Required {
        require_pre_images(storage, req)?;
    }

    // Entries logged without a majority wait (the election noop on an idle
    // shard) would otherwise pin the watermark below every later write.
    rs.replicate_once();
    // Taken before reading: nothing at or below it can still appear.
    let watermark = rs.committed_watermark()?;
    let mut reader = Reader {
        shard,
        req,
        storage,
        events: Vec::new(),
        invalidated: false,
    };
    let mut high_water = watermark;
    let mut cursor = from;
    'scan: loop {
        let entries = rs.read_committed_oplog(cursor, SCAN_BATCH)?;
        let Some(last) = entries.last() else {
            break;
        };
        cursor = last.ts;
        let exhausted = entries.len() < SCAN_BATCH;
        for entry in &entries {
            if entry.ts > watermark {
                break 'scan;
            }
            if entry.from_migrate {
                continue;
            }
            reader.translate(entry, |ts| primary.oplog().find(ts))?;
            if reader.invalidated || (req.limit > 0 && reader.events.len() >= req.limit) {
                high_water = entry.ts;
                break 'scan;
            }
        }
        if exhausted {
            break;
        }
    }

    let mut events = reader.events;
    events.sort_by(|a, b| a.token.cmp(&b.token));
    Ok(ShardChangeBatch { events, high_water })
}

/// Fail up front when some collection the stream may report on keeps no
/// pre-images.
fn require_pre_images(storage: &StorageNode, req: &ShardStreamRequest) -> KestrelResult<()> {
    let wants_pre_image = [
        OperationType::Update,
        OperationType::Replace,
        OperationType::Delete,
    ]
    .iter()
    .any(|op| req.filter.op_types.is_empty() || req.filter.op_types.contains(op));
    if !wants_pre_image {
        return Ok(());
    }
    for info in storage.list_collections() {
        let covered = req.target.matches_ns(&info.ns)
            && (req.filter.namespaces.is_empty() || req.filter.namespaces.contains(&info.ns));
        if covered && !info.options.pre_images {
            return Err(ChangeStreamError::PreImagesRequired(info.ns.to_string()).into());
        }
    }
    Ok(())
}

struct Reader<'a> {
    shard: ShardId,
    req: &'a ShardStreamRequest,
    storage: &'a StorageNode,
    events: Vec<ChangeEvent>,
    invalidated: bool,
}

impl Reader<'_> {
    fn translate(
        &mut self,
        entry: &OplogEntry,
        find: impl Fn(LogicalTimestamp) -> Option<OplogEntry>,
    ) -> KestrelResult<()> {
        match &entry.op {
            OplogOp::Crud(op) => {
                if let Some(uuid) = entry.uuid {
                    self.crud(entry.ts, 0, &entry.ns, uuid, op, entry.ts, None)?;
                }
            }
            OplogOp::ApplyOps { ops, prepare: false } => {
                self.txn_ops(entry.ts, ops, entry.ts, entry.txn.as_ref())?;
            }
            OplogOp::CommitTransaction { commit_ts, prepare_ts } => {
                let prepared = find(*prepare_ts).ok_or_else(|| {
                    ChangeStreamError::Fatal(format!(
                        "prepare entry at {prepare_ts} missing for commit at {}",
                        entry.ts
                    ))
                })?;
                if let OplogOp::ApplyOps { ops, .. } = &prepared.op {
                    self.txn_ops(entry.ts, ops, *commit_ts, entry.txn.as_ref())?;
                }
            }
            OplogOp::Drop => {
                if self.req.target.matches_ns(&entry.ns) {
                    let token = ResumeToken::event(entry.ts, self.shard, 0, None, entry.uuid);
                    let drop = ChangeEvent::new(token, OperationType::Drop, entry.ns.clone());
                    let invalidates = matches!(self.req.target, WatchTarget::Collection(_));
                    self.push(drop, invalidates);
                }
            }
            OplogOp::DropDatabase => {
                let watched = match &self.req.target {
                    WatchTarget::Database(db) => *db == entry.ns.db,
                    WatchTarget::Cluster => true,
                    WatchTarget::Collection(_) => false,
                };
                if watched {
                    let token = ResumeToken::event(entry.ts, self.shard, 0, None, None);
                    let event =
                        ChangeEvent::new(token, OperationType::DropDatabase, entry.ns.clone());
                    let invalidates = matches!(self.req.target, WatchTarget::Database(_));
                    self.push(event, invalidates);
                }
            }
            OplogOp::ReshardCollection { key_pattern, .. } => {
                if self.req.target.matches_ns(&entry.ns) {
                    let token = ResumeToken::event(entry.ts, self.shard, 0, None, entry.uuid);
                    let mut event =
                        ChangeEvent::new(token, OperationType::ReshardCollection, entry.ns.clone());
                    event.new_shard_key = Some(key_pattern.clone());
                    self.push(event, false);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn txn_ops(
        &mut self,
        ts: LogicalTimestamp,
        ops: &[TxnOp],
        applied_at: LogicalTimestamp,
        txn: Option<&TxnInfo>,
    ) -> KestrelResult<()> {
        for (i, t) in ops.iter().enumerate() {
            let index = u32::try_from(i).unwrap_or(u32::MAX);
            self.crud(ts, index, &t.ns, t.uuid, &t.op, applied_at, txn)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn crud(
        &mut self,
        ts: LogicalTimestamp,
        txn_op_index: u32,
        ns: &Namespace,
        uuid: CollectionUuid,
        op: &CrudOp,
        applied_at: LogicalTimestamp,
        txn: Option<&TxnInfo>,
    ) -> KestrelResult<()> {
        if !self.req.target.matches_ns(ns) {
            return Ok(());
        }
        let op_type = match op {
            CrudOp::Insert { .. } => OperationType::Insert,
            CrudOp::Update { is_replacement: true, .. } => OperationType::Replace,
            CrudOp::Update { .. } => OperationType::Update,
            CrudOp::Delete { .. } => OperationType::Delete,
        };
        if !self.req.filter.matches(op_type, ns) {
            return Ok(());
        }
        let doc_key = op.doc_key()?;
        let token = ResumeToken::event(
            ts,
            self.shard,
            txn_op_index,
            Some(doc_key.0.clone()),
            Some(uuid),
        );
        if token <= self.req.after {
            return Ok(());
        }
        let mut event = ChangeEvent::new(token, op_type, ns.clone());
        match op {
            CrudOp::Insert { doc } => event.full_document = Some(doc.clone()),
            CrudOp::Update {
                post_image,
                updated_fields,
                removed_fields,
                is_replacement,
                ..
            } => {
                if *is_replacement {
                    event.full_document = Some(post_image.clone());
                } else {
                    event.update_description = Some(UpdateDescription {
                        updated_fields: updated_fields.clone(),
                        removed_fields: removed_fields.clone(),
                    });
                    if self.req.full_document == FullDocumentMode::UpdateLookup {
                        event.full_document = self.storage.get_latest(ns, &doc_key);
                    }
                }
            }
            CrudOp::Delete { .. } => {}
        }
        if op_type != OperationType::Insert && self.req.before_change != PreImageMode::Off {
            let pre = self.storage.pre_image(uuid, applied_at, &doc_key);
            if pre.is_none() && self.req.before_change == PreImageMode::Required {
                return Err(ChangeStreamError::PreImageMissing {
                    ns: ns.to_string(),
                    doc: doc_key.to_string(),
                    ts: applied_at,
                }
                .into());
            }
            event.full_document_before_change = pre;
        }
        if let Some(t) = txn {
            event.lsid = Some(t.lsid);
            event.txn_number = Some(t.txn_number);
        }
        self.events.push(event);
        Ok(())
    }

    fn push(&mut self, event: ChangeEvent, invalidates: bool) {
        if event.token <= self.req.after && !invalidates {
            return;
        }
        let passes = self.req.filter.matches(event.operation_type, &event.ns);
        if invalidates {
            let invalidate = event.invalidate();
            if event.token > self.req.after && passes {
                self.events.push(event);
            }
            if invalidate.token > self.req.after {
                self.events.push(invalidate);
                self.invalidated = true;
            }
        } else if passes {
            self.events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::EventFilter;
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::{ClusterClock, DocKey, Document, KeyValue, ManualWallClock, WriteConcern};
    use kestrel_repl::OplogDraft;
    use kestrel_storage::CollectionOptions;
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    fn request(target: WatchTarget) -> ShardStreamRequest {
        ShardStreamRequest {
            target,
            after: ResumeToken::start_at(LogicalTimestamp::MIN),
            limit: 0,
            full_document: FullDocumentMode::Default,
            before_change: PreImageMode::Off,
            filter: EventFilter::default(),
        }
    }

    fn set_with_collection(
        pre_images: bool,
    ) -> (std::sync::Arc<ReplicaSet>, Namespace, CollectionUuid) {
        let rs = ReplicaSet::new(
            "shard0",
            1,
            ClusterClock::new(ManualWallClock::new(50)),
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let ns = Namespace::new("app", "orders");
        let uuid = CollectionUuid::generate();
        rs.write_with_concern(WriteConcern::Majority, |w| {
            w.log(OplogDraft::new(
                ns.clone(),
                Some(uuid),
                OplogOp::Create { options: CollectionOptions { pre_images } },
            ))?;
            Ok(())
        })
        .unwrap();
        (rs, ns, uuid)
    }

    fn log(rs: &ReplicaSet, ns: &Namespace, uuid: CollectionUuid, op: CrudOp) {
        rs.write_with_concern(WriteConcern::Majority, |w| {
            w.log(OplogDraft::new(ns.clone(), Some(uuid), OplogOp::Crud(op)))?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_translates_crud_and_skips_migration_writes() {
        let (rs, ns, uuid) = set_with_collection(true);
        log(&rs, &ns, uuid, CrudOp::Insert { doc: doc(json!({"_id": 1, "v": 1})) });
        log(
            &rs,
            &ns,
            uuid,
            CrudOp::Update {
                doc_key: DocKey(KeyValue::Int(1)),
                post_image: doc(json!({"_id": 1, "v": 2})),
                updated_fields: doc(json!({"v": 2})),
                removed_fields: Vec::new(),
                is_replacement: false,
            },
        );
        rs.write_with_concern(WriteConcern::Majority, |w| {
            w.log(
                OplogDraft::new(
                    ns.clone(),
                    Some(uuid),
                    OplogOp::Crud(CrudOp::Insert { doc: doc(json!({"_id": 2})) }),
                )
                .from_migrate(),
            )?;
            Ok(())
        })
        .unwrap();
        log(&rs, &ns, uuid, CrudOp::Delete { doc_key: DocKey(KeyValue::Int(1)) });

        let mut req = request(WatchTarget::Collection(ns.clone()));
        req.before_change = PreImageMode::Required;
        let batch = read_changes(&rs, ShardId(0), &req).unwrap();
        let ops: Vec<OperationType> = batch.events.iter().map(|e| e.operation_type).collect();
        assert_eq!(
            ops,
            vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
        );
        assert_eq!(
            batch.events[1].full_document_before_change,
            Some(doc(json!({"_id": 1, "v": 1})))
        );
        assert_eq!(
            batch.events[2].full_document_before_change,
            Some(doc(json!({"_id": 1, "v": 2})))
        );
        assert!(batch.high_water >= batch.events[2].cluster_time);

        let mut resumed = req.clone();
        resumed.after = batch.events[0].token.clone();
        let rest = read_changes(&rs, ShardId(0), &resumed).unwrap();
        assert_eq!(rest.events.len(), 2);
    }

    #[test]
    fn test_required_pre_images_fail_when_disabled_unless_filtered_out() {
        let (rs, ns, uuid) = set_with_collection(false);
        log(&rs, &ns, uuid, CrudOp::Insert { doc: doc(json!({"_id": 1})) });
        let mut req = request(WatchTarget::Collection(ns.clone()));
        req.before_change = PreImageMode::Required;
        let err = read_changes(&rs, ShardId(0), &req).unwrap_err();
        assert!(matches!(
            err,
            kestrel_common::KestrelError::ChangeStream(ChangeStreamError::PreImagesRequired(_))
        ));

        req.filter = EventFilter::op_types([OperationType::Insert]);
        let batch = read_changes(&rs, ShardId(0), &req).unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[test]
    fn test_drop_emits_drop_then_invalidate() {
        let (rs, ns, uuid) = set_with_collection(false);
        log(&rs, &ns, uuid, CrudOp::Insert { doc: doc(json!({"_id": 1})) });
        rs.write_with_concern(WriteConcern::Majority, |w| {
            w.log(OplogDraft::new(ns.clone(), Some(uuid), OplogOp::Drop))?;
            Ok(())
        })
        .unwrap();
        let coll = read_changes(
            &rs,
            ShardId(0),
            &request(WatchTarget::Collection(ns.clone())),
        ).unwrap();
        let ops: Vec<OperationType> = coll.events.iter().map(|e| e.operation_type).collect();
        assert_eq!(
            ops,
            vec![OperationType::Insert, OperationType::Drop, OperationType::Invalidate]
        );

        let db = read_changes(
            &rs,
            ShardId(0),
            &request(WatchTarget::Database("app".into())),
        ).unwrap();
        assert_eq!(db.events.last().map(|e| e.operation_type), Some(OperationType::Drop));
    }

    #[test]
    fn test_unreplicated_entries_do_not_hold_stream_back() {
        let rs = ReplicaSet::new(
            "shard1",
            3,
            ClusterClock::new(ManualWallClock::new(50)),
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let ns = Namespace::new("app", "orders");
        let uuid = CollectionUuid::generate();
        let out = rs
            .write(|w| {
                w.log(OplogDraft::new(
                    ns.clone(),
                    Some(uuid),
                    OplogOp::Create { options: CollectionOptions::default() },
                ))?;
                w.log(OplogDraft::new(
                    ns.clone(),
                    Some(uuid),
                    OplogOp::Crud(CrudOp::Insert { doc: doc(json!({"_id": 1})) }),
                ))
            })
            .unwrap();
        assert!(rs.majority_point() < out.value);

        let batch = read_changes(&rs, ShardId(1), &request(WatchTarget::Collection(ns))).unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(batch.high_water >= out.value.ts);
    }

    #[test]
    fn test_limit_cuts_batch_at_entry_boundary() {
        let (rs, ns, uuid) = set_with_collection(false);
        for i in 0..5 {
            log(&rs, &ns, uuid, CrudOp::Insert { doc: doc(json!({"_id": i})) });
        }
        let mut req = request(WatchTarget::Collection(ns));
        req.limit = 2;
        let batch = read_changes(&rs, ShardId(0), &req).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.high_water, batch.events[1].cluster_time);
    }
}
