//! Oplog application. The same code runs on the primary when it writes an
//! entry and on secondaries when they replay it, so all members converge.

use std::collections::BTreeMap;

use kestrel_common::error::ReplError;
use kestrel_common::{KestrelResult, LogicalTimestamp, Namespace, TxnKey};
use kestrel_storage::StorageNode;

use crate::node::{PreparedTxn, ReplicaNode};
use crate::oplog::{CrudOp, OplogEntry, OplogOp, TxnOp};

fn apply_crud(
    storage: &StorageNode,
    ns: &Namespace,
    op: &CrudOp,
    ts: LogicalTimestamp,
) -> KestrelResult<()> {
    match op {
        CrudOp::Insert { doc } => storage.put(ns, doc.clone(), ts)?,
        CrudOp::Update { post_image, .. } => storage.put(ns, post_image.clone(), ts)?,
        CrudOp::Delete { doc_key } => storage.delete(ns, doc_key, ts)?,
    };
    Ok(())
}

fn apply_txn_ops(storage: &StorageNode, ops: &[TxnOp], ts: LogicalTimestamp) -> KestrelResult<()> {
    for t in ops {
        apply_crud(storage, &t.ns, &t.op, ts)?;
    }
    Ok(())
}

/// Apply one entry to `node`'s storage and prepared-transaction table.
/// Does not touch the node's oplog.
pub fn apply_entry(node: &ReplicaNode, entry: &OplogEntry) -> KestrelResult<()> {
    let storage = node.storage();
    match &entry.op {
        OplogOp::Crud(op) => apply_crud(storage, &entry.ns, op, entry.ts)?,
        OplogOp::Noop { .. }
        | OplogOp::ReshardCollection { .. }
        | OplogOp::SessionOutcomes { .. } => {}
        OplogOp::Create { options } => {
            let uuid = entry
                .uuid
                .ok_or_else(|| ReplError::Corrupt(format!("create of {} without uuid", entry.ns)))?;
            storage.create_collection(&entry.ns, uuid, *options, entry.ts)?;
        }
        OplogOp::CollMod { options } => storage.set_collection_options(&entry.ns, *options)?,
        OplogOp::Drop => {
            storage.drop_collection(&entry.ns);
        }
        OplogOp::DropDatabase => {
            for info in storage.list_collections() {
                if info.ns.db == entry.ns.db {
                    storage.drop_collection(&info.ns);
                }
            }
        }
        OplogOp::ApplyOps { ops, prepare: false } => apply_txn_ops(storage, ops, entry.ts)?,
        OplogOp::ApplyOps { ops, prepare: true } => {
            let txn = entry.txn.as_ref().ok_or_else(|| {
                ReplError::Corrupt(format!("prepare at {} without session info", entry.ts))
            })?;
            node.add_prepared(PreparedTxn {
                key: txn.key(),
                prepare_ts: entry.ts,
                ops: ops.clone(),
                stmt_ids: txn.stmt_ids.clone(),
            });
        }
        OplogOp::CommitTransaction { commit_ts, .. } => {
            let key = txn_key(entry)?;
            match node.take_prepared(&key) {
                Some(p) => apply_txn_ops(storage, &p.ops, *commit_ts)?,
                None => {
                    tracing::warn!(node = %node.id(), txn = %key, "commit for unknown prepared txn")
                }
            }
        }
        OplogOp::AbortTransaction => {
            let key = txn_key(entry)?;
            node.take_prepared(&key);
        }
    }
    Ok(())
}

fn txn_key(entry: &OplogEntry) -> KestrelResult<TxnKey> {
    entry.txn.as_ref().map(|t| t.key()).ok_or_else(|| {
        ReplError::Corrupt(format!("{} at {} without session info", entry.op.kind(), entry.ts))
            .into()
    })
}

/// Recompute the prepared table from the oplog: every prepare without a
/// later commit or abort for the same transaction.
pub fn rebuild_prepared(node: &ReplicaNode) -> usize {
    let mut open: BTreeMap<TxnKey, PreparedTxn> = BTreeMap::new();
    for e in node.oplog().entries() {
        let Some(txn) = &e.txn else { continue };
        match &e.op {
            OplogOp::ApplyOps { ops, prepare: true } => {
                open.insert(
                    txn.key(),
                    PreparedTxn {
                        key: txn.key(),
                        prepare_ts: e.ts,
                        ops: ops.clone(),
                        stmt_ids: txn.stmt_ids.clone(),
                    },
                );
            }
            OplogOp::CommitTransaction { .. } | OplogOp::AbortTransaction => {
                open.remove(&txn.key());
            }
            _ => {}
        }
    }
    let n = open.len();
    node.replace_prepared(open.into_values().collect());
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::TxnInfo;
    use kestrel_common::{CollectionUuid, DocKey, KeyValue, Lsid, NodeId, TxnNumber};
    use kestrel_storage::CollectionOptions;
    use serde_json::json;

    fn ts(s: u32) -> LogicalTimestamp {
        LogicalTimestamp::new(s, 0)
    }

    fn entry(secs: u32, uuid: CollectionUuid, op: OplogOp, txn: Option<TxnInfo>) -> OplogEntry {
        OplogEntry {
            ts: ts(secs),
            term: 1,
            ns: Namespace::new("db", "c"),
            uuid: Some(uuid),
            op,
            txn,
            from_migrate: false,
            wall_secs: secs,
        }
    }

    fn insert_op(id: i64) -> TxnOp {
        TxnOp {
            ns: Namespace::new("db", "c"),
            uuid: CollectionUuid::generate(),
            op: CrudOp::Insert {
                doc: json!({"_id": id}).as_object().cloned().unwrap(),
            },
        }
    }

    fn setup() -> (std::sync::Arc<ReplicaNode>, CollectionUuid) {
        let node = ReplicaNode::new(NodeId(0), "rs");
        let uuid = CollectionUuid::generate();
        apply_entry(
            &node,
            &entry(1, uuid, OplogOp::Create { options: CollectionOptions::default() }, None),
        )
        .unwrap();
        (node, uuid)
    }

    #[test]
    fn test_prepared_ops_apply_at_commit_ts() {
        let (node, uuid) = setup();
        let info = TxnInfo {
            lsid: Lsid::generate(),
            txn_number: TxnNumber(1),
            stmt_ids: vec![0],
        };
        let prepare = entry(
            5,
            uuid,
            OplogOp::ApplyOps { ops: vec![insert_op(7)], prepare: true },
            Some(info.clone()),
        );
        apply_entry(&node, &prepare).unwrap();
        let ns = Namespace::new("db", "c");
        assert_eq!(node.storage().count_latest(&ns), 0);
        assert_eq!(node.oldest_prepare_ts(), Some(ts(5)));

        let commit = entry(
            8,
            uuid,
            OplogOp::CommitTransaction { commit_ts: ts(6), prepare_ts: ts(5) },
            Some(info),
        );
        apply_entry(&node, &commit).unwrap();
        assert!(node.oldest_prepare_ts().is_none());
        let id = DocKey(KeyValue::Int(7));
        assert!(node.storage().get(&ns, &id, ts(5)).unwrap().is_none());
        assert!(node.storage().get(&ns, &id, ts(6)).unwrap().is_some());
    }

    #[test]
    fn test_rebuild_prepared_skips_resolved() {
        let (node, uuid) = setup();
        let open = TxnInfo { lsid: Lsid::generate(), txn_number: TxnNumber(1), stmt_ids: vec![] };
        let done = TxnInfo { lsid: Lsid::generate(), txn_number: TxnNumber(1), stmt_ids: vec![] };
        let entries = vec![
            entry(
                2,
                uuid,
                OplogOp::ApplyOps { ops: vec![insert_op(1)], prepare: true },
                Some(open.clone()),
            ),
            entry(
                3,
                uuid,
                OplogOp::ApplyOps { ops: vec![insert_op(2)], prepare: true },
                Some(done.clone()),
            ),
            entry(4, uuid, OplogOp::AbortTransaction, Some(done)),
        ];
        for e in entries {
            node.oplog().append(e).unwrap();
        }
        assert_eq!(rebuild_prepared(&node), 1);
        assert!(node.prepared(&open.key()).is_some());
    }

    #[test]
    fn test_commit_without_session_is_corrupt() {
        let (node, uuid) = setup();
        let e = entry(
            3,
            uuid,
            OplogOp::CommitTransaction { commit_ts: ts(3), prepare_ts: ts(2) },
            None,
        );
        assert!(apply_entry(&node, &e).is_err());
    }
}
