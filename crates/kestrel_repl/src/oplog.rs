//! The operation log.
//!
//! Every state change a replica-set member makes is recorded as an
//! [`OplogEntry`], in strictly increasing timestamp order. Entries carry
//! post-images, so re-applying an entry is idempotent. Secondaries pull
//! [`OplogBatch`]es; each batch is checksummed the way WAL chunks are.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use kestrel_common::error::ReplError;
use kestrel_common::{
    CollectionUuid, DocKey, Document, KestrelResult, Lsid, LogicalTimestamp, Namespace, OpTime,
    ShardKeyPattern, StmtId, TxnKey, TxnNumber,
};
use kestrel_storage::CollectionOptions;

/// Session information attached to retryable writes and transaction entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnInfo {
    pub lsid: Lsid,
    pub txn_number: TxnNumber,
    /// Statement ids this entry executed, for retryable-write replay.
    pub stmt_ids: Vec<StmtId>,
}

impl TxnInfo {
    pub fn key(&self) -> TxnKey {
        TxnKey::new(self.lsid, self.txn_number)
    }
}

/// Single-document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CrudOp {
    Insert {
        doc: Document,
    },
    Update {
        doc_key: DocKey,
        post_image: Document,
        updated_fields: Document,
        removed_fields: Vec<String>,
        is_replacement: bool,
    },
    Delete {
        doc_key: DocKey,
    },
}

impl CrudOp {
    pub fn doc_key(&self) -> KestrelResult<DocKey> {
        match self {
            CrudOp::Insert { doc } => DocKey::of(doc),
            CrudOp::Update { doc_key, .. } | CrudOp::Delete { doc_key } => Ok(doc_key.clone()),
        }
    }

    /// The document as it exists after this operation, if any.
    pub fn post_image(&self) -> Option<&Document> {
        match self {
            CrudOp::Insert { doc } => Some(doc),
            CrudOp::Update { post_image, .. } => Some(post_image),
            CrudOp::Delete { .. } => None,
        }
    }
}

/// One operation inside an `applyOps` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnOp {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub op: CrudOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OplogOp {
    Crud(CrudOp),
    Noop {
        msg: String,
    },
    Create {
        options: CollectionOptions,
    },
    CollMod {
        options: CollectionOptions,
    },
    Drop,
    DropDatabase,
    /// A transaction's writes. `prepare` entries are applied at the commit
    /// timestamp carried by the matching `CommitTransaction`.
    ApplyOps {
        ops: Vec<TxnOp>,
        prepare: bool,
    },
    CommitTransaction {
        commit_ts: LogicalTimestamp,
        prepare_ts: LogicalTimestamp,
    },
    AbortTransaction,
    /// Marks the point where a collection switched to a new incarnation.
    ReshardCollection {
        new_uuid: CollectionUuid,
        key_pattern: ShardKeyPattern,
    },
    /// Retryable-write outcomes not derivable from the CRUD entries alone,
    /// including history received with a migrated chunk.
    SessionOutcomes {
        outcomes: Vec<(StmtId, StmtOutcome)>,
    },
}

/// Result recorded for an executed retryable statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StmtOutcome {
    pub n: u64,
    pub n_modified: u64,
}

impl OplogOp {
    pub fn kind(&self) -> &'static str {
        match self {
            OplogOp::Crud(CrudOp::Insert { .. }) => "insert",
            OplogOp::Crud(CrudOp::Update { .. }) => "update",
            OplogOp::Crud(CrudOp::Delete { .. }) => "delete",
            OplogOp::Noop { .. } => "noop",
            OplogOp::Create { .. } => "create",
            OplogOp::CollMod { .. } => "collMod",
            OplogOp::Drop => "drop",
            OplogOp::DropDatabase => "dropDatabase",
            OplogOp::ApplyOps { .. } => "applyOps",
            OplogOp::CommitTransaction { .. } => "commitTransaction",
            OplogOp::AbortTransaction => "abortTransaction",
            OplogOp::ReshardCollection { .. } => "reshardCollection",
            OplogOp::SessionOutcomes { .. } => "sessionOutcomes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: LogicalTimestamp,
    pub term: u64,
    pub ns: Namespace,
    pub uuid: Option<CollectionUuid>,
    pub op: OplogOp,
    pub txn: Option<TxnInfo>,
    /// Written by chunk migration or resharding rather than by a client.
    pub from_migrate: bool,
    pub wall_secs: u32,
}

impl OplogEntry {
    pub fn optime(&self) -> OpTime {
        OpTime::new(self.ts, self.term)
    }

    /// `(ns, _id)` pairs whose stored state this entry changes.
    pub fn touched_docs(&self) -> Vec<(Namespace, DocKey)> {
        match &self.op {
            OplogOp::Crud(op) => op
                .doc_key()
                .map(|k| vec![(self.ns.clone(), k)])
                .unwrap_or_default(),
            OplogOp::ApplyOps { ops, .. } => ops
                .iter()
                .filter_map(|t| t.op.doc_key().ok().map(|k| (t.ns.clone(), k)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Fields of an entry supplied by the writer; the replica set stamps the rest.
#[derive(Debug, Clone)]
pub struct OplogDraft {
    pub ns: Namespace,
    pub uuid: Option<CollectionUuid>,
    pub op: OplogOp,
    pub txn: Option<TxnInfo>,
    pub from_migrate: bool,
}

impl OplogDraft {
    pub fn new(ns: Namespace, uuid: Option<CollectionUuid>, op: OplogOp) -> Self {
        Self {
            ns,
            uuid,
            op,
            txn: None,
            from_migrate: false,
        }
    }

    pub fn with_txn(mut self, txn: TxnInfo) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn from_migrate(mut self) -> Self {
        self.from_migrate = true;
        self
    }
}

// ── Batches ──

/// Entries shipped from a sync source to a secondary in one pull.
#[derive(Debug, Clone)]
pub struct OplogBatch {
    pub entries: Vec<OplogEntry>,
    pub checksum: u32,
}

impl OplogBatch {
    pub fn new(entries: Vec<OplogEntry>) -> Self {
        let checksum = Self::compute_checksum(&entries);
        Self { entries, checksum }
    }

    fn compute_checksum(entries: &[OplogEntry]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for e in entries {
            match bincode::serialize(e) {
                Ok(bytes) => hasher.update(&bytes),
                // Documents that bincode cannot encode still hash by position.
                Err(_) => hasher.update(&e.ts.as_u64().to_le_bytes()),
            }
        }
        hasher.finalize()
    }

    pub fn verify(&self) -> KestrelResult<()> {
        let actual = Self::compute_checksum(&self.entries);
        if actual != self.checksum {
            return Err(ReplError::Corrupt(format!(
                "batch checksum mismatch: expected {:08x}, got {actual:08x}",
                self.checksum
            ))
            .into());
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_optime(&self) -> Option<OpTime> {
        self.entries.last().map(OplogEntry::optime)
    }
}

// ── Log ──

#[derive(Debug, Default)]
struct OplogInner {
    entries: VecDeque<OplogEntry>,
    /// Timestamp of the newest entry removed from the head, if any.
    truncated_through: Option<LogicalTimestamp>,
}

impl OplogInner {
    fn index_after(&self, ts: LogicalTimestamp) -> usize {
        self.entries.partition_point(|e| e.ts <= ts)
    }
}

/// One member's oplog.
#[derive(Debug, Default)]
pub struct Oplog {
    inner: RwLock<OplogInner>,
}

impl Oplog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Timestamps must be strictly increasing.
    pub fn append(&self, entry: OplogEntry) -> KestrelResult<()> {
        let mut inner = self.inner.write();
        if let Some(last) = inner.entries.back() {
            if entry.ts <= last.ts {
                return Err(ReplError::OplogOutOfOrder {
                    last: last.ts,
                    attempted: entry.ts,
                }
                .into());
            }
        }
        inner.entries.push_back(entry);
        Ok(())
    }

    pub fn last_optime(&self) -> OpTime {
        self.inner
            .read()
            .entries
            .back()
            .map(OplogEntry::optime)
            .unwrap_or_default()
    }

    pub fn first_ts(&self) -> Option<LogicalTimestamp> {
        self.inner.read().entries.front().map(|e| e.ts)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Up to `limit` entries with `after < ts <= upto`.
    pub fn read_range(
        &self,
        after: LogicalTimestamp,
        upto: LogicalTimestamp,
        limit: usize,
    ) -> Vec<OplogEntry> {
        let inner = self.inner.read();
        let start = inner.index_after(after);
        inner
            .entries
            .iter()
            .skip(start)
            .take_while(|e| e.ts <= upto)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn read_after(&self, after: LogicalTimestamp, limit: usize) -> Vec<OplogEntry> {
        self.read_range(after, LogicalTimestamp::MAX, limit)
    }

    pub fn find(&self, ts: LogicalTimestamp) -> Option<OplogEntry> {
        let inner = self.inner.read();
        let idx = inner.entries.partition_point(|e| e.ts < ts);
        inner.entries.get(idx).filter(|e| e.ts == ts).cloned()
    }

    pub fn contains(&self, optime: OpTime) -> bool {
        self.find(optime.ts).is_some_and(|e| e.term == optime.term)
    }

    /// True if no entry newer than `ts` has been truncated from the head, so a
    /// reader resuming after `ts` sees a gap-free history.
    pub fn has_history_after(&self, ts: LogicalTimestamp) -> bool {
        match self.inner.read().truncated_through {
            None => true,
            Some(through) => ts >= through,
        }
    }

    pub fn truncated_through(&self) -> Option<LogicalTimestamp> {
        self.inner.read().truncated_through
    }

    /// Remove every entry newer than `ts`, returning them oldest first.
    pub fn truncate_after(&self, ts: LogicalTimestamp) -> Vec<OplogEntry> {
        let mut inner = self.inner.write();
        let keep = inner.index_after(ts);
        inner.entries.drain(keep..).collect()
    }

    /// Drop head entries until at most `max_entries` remain, never removing
    /// an entry at or after `pin`. Returns the number removed.
    pub fn truncate_head(&self, max_entries: usize, pin: Option<LogicalTimestamp>) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        while inner.entries.len() > max_entries {
            let Some(front) = inner.entries.front() else {
                break;
            };
            if pin.is_some_and(|p| front.ts >= p) {
                break;
            }
            let ts = front.ts;
            inner.entries.pop_front();
            inner.truncated_through = Some(ts);
            removed += 1;
        }
        removed
    }

    /// Newest entry at or before `ts`.
    pub fn entry_at_or_before(&self, ts: LogicalTimestamp) -> Option<OplogEntry> {
        let inner = self.inner.read();
        let idx = inner.index_after(ts);
        if idx == 0 {
            None
        } else {
            inner.entries.get(idx - 1).cloned()
        }
    }

    /// Clone of every retained entry, oldest first.
    pub fn entries(&self) -> Vec<OplogEntry> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// Replace the whole log (initial sync).
    pub fn reset_from(&self, source: &Oplog) {
        let src = source.inner.read();
        let mut inner = self.inner.write();
        inner.entries = src.entries.clone();
        inner.truncated_through = src.truncated_through;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(secs: u32, term: u64) -> OplogEntry {
        OplogEntry {
            ts: LogicalTimestamp::new(secs, 0),
            term,
            ns: Namespace::new("db", "c"),
            uuid: None,
            op: OplogOp::Crud(CrudOp::Insert {
                doc: json!({"_id": secs}).as_object().cloned().unwrap(),
            }),
            txn: None,
            from_migrate: false,
            wall_secs: secs,
        }
    }

    #[test]
    fn test_append_rejects_non_increasing_ts() {
        let log = Oplog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        let err = log.append(entry(2, 1)).unwrap_err();
        assert!(err.to_string().contains("out of order"));
        assert_eq!(log.last_optime(), OpTime::new(LogicalTimestamp::new(2, 0), 1));
    }

    #[test]
    fn test_read_range_is_exclusive_inclusive() {
        let log = Oplog::new();
        for s in 1..=5 {
            log.append(entry(s, 1)).unwrap();
        }
        let got = log.read_range(LogicalTimestamp::new(2, 0), LogicalTimestamp::new(4, 0), 10);
        let secs: Vec<u32> = got.iter().map(|e| e.ts.secs).collect();
        assert_eq!(secs, vec![3, 4]);
        assert_eq!(log.read_after(LogicalTimestamp::MIN, 2).len(), 2);
    }

    #[test]
    fn test_truncate_after_returns_removed_suffix() {
        let log = Oplog::new();
        for s in 1..=4 {
            log.append(entry(s, 1)).unwrap();
        }
        let removed = log.truncate_after(LogicalTimestamp::new(2, 0));
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].ts.secs, 3);
        assert_eq!(log.len(), 2);
        assert!(log.contains(OpTime::new(LogicalTimestamp::new(2, 0), 1)));
        assert!(!log.contains(OpTime::new(LogicalTimestamp::new(2, 0), 2)));
    }

    #[test]
    fn test_truncate_head_respects_pin() {
        let log = Oplog::new();
        for s in 1..=6 {
            log.append(entry(s, 1)).unwrap();
        }
        let removed = log.truncate_head(1, Some(LogicalTimestamp::new(3, 0)));
        assert_eq!(removed, 2);
        assert_eq!(log.first_ts(), Some(LogicalTimestamp::new(3, 0)));
        assert!(!log.has_history_after(LogicalTimestamp::new(1, 0)));
        assert!(log.has_history_after(LogicalTimestamp::new(2, 0)));
    }

    #[test]
    fn test_batch_checksum_detects_tampering() {
        let mut batch = OplogBatch::new(vec![entry(1, 1), entry(2, 1)]);
        batch.verify().unwrap();
        batch.entries[1].term = 9;
        assert!(batch.verify().is_err());
    }
}
