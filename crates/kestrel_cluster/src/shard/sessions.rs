//! Retryable-write bookkeeping.
//!
//! For each logical session the shard remembers the newest transaction
//! number it has seen and the outcome of every statement executed under it.
//! A retried statement is answered from this table instead of running
//! again. The table is derived state: on step-up it is rebuilt from the
//! oplog, and when a chunk migrates the entries whose documents moved are
//! shipped to the recipient.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::TxnError;
use kestrel_common::{
    Document, KestrelResult, KeyRange, Lsid, Namespace, ShardKey, StmtId, TxnNumber,
};
use kestrel_repl::{CrudOp, OplogEntry, OplogOp, StmtOutcome};

/// Retryable-write history handed from a migration donor to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedSession {
    pub lsid: Lsid,
    pub txn_number: TxnNumber,
    pub ns: Namespace,
    pub statements: Vec<(StmtId, StmtOutcome)>,
}

#[derive(Debug, Clone)]
struct ExecutedStmt {
    outcome: StmtOutcome,
    ns: Namespace,
    /// Shard keys of the documents the statement wrote.
    keys: Vec<ShardKey>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    txn_number: TxnNumber,
    executed: BTreeMap<StmtId, ExecutedStmt>,
}

impl SessionRecord {
    fn new(txn_number: TxnNumber) -> Self {
        Self {
            txn_number,
            executed: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionCatalog {
    sessions: Mutex<HashMap<Lsid, SessionRecord>>,
    replays: AtomicU64,
    rebuilds: AtomicU64,
}

impl SessionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `txn_number` the session's active number. Older numbers are
    /// rejected; a newer one forgets the previous statements.
    pub fn begin(&self, lsid: Lsid, txn_number: TxnNumber) -> KestrelResult<()> {
        let mut sessions = self.sessions.lock();
        let rec = sessions
            .entry(lsid)
            .or_insert_with(|| SessionRecord::new(txn_number));
        if txn_number < rec.txn_number {
            return Err(TxnError::TransactionTooOld {
                requested: txn_number.0,
                current: rec.txn_number.0,
            }
            .into());
        }
        if txn_number > rec.txn_number {
            *rec = SessionRecord::new(txn_number);
        }
        Ok(())
    }

    /// Outcome of `stmt_id` if it already executed under `txn_number`.
    pub fn executed(
        &self,
        lsid: Lsid,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> KestrelResult<Option<StmtOutcome>> {
        let sessions = self.sessions.lock();
        let Some(rec) = sessions.get(&lsid) else {
            return Ok(None);
        };
        if txn_number < rec.txn_number {
            return Err(TxnError::TransactionTooOld {
                requested: txn_number.0,
                current: rec.txn_number.0,
            }
            .into());
        }
        if txn_number > rec.txn_number {
            return Ok(None);
        }
        let found = rec.executed.get(&stmt_id).map(|s| s.outcome);
        if found.is_some() {
            self.replays.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    pub fn record(
        &self,
        lsid: Lsid,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        outcome: StmtOutcome,
        ns: &Namespace,
        keys: Vec<ShardKey>,
    ) {
        let mut sessions = self.sessions.lock();
        let rec = sessions
            .entry(lsid)
            .or_insert_with(|| SessionRecord::new(txn_number));
        if txn_number > rec.txn_number {
            *rec = SessionRecord::new(txn_number);
        }
        if txn_number == rec.txn_number {
            rec.executed.insert(
                stmt_id,
                ExecutedStmt {
                    outcome,
                    ns: ns.clone(),
                    keys,
                },
            );
        }
    }

    /// Statements that wrote at least one document of `ns` inside `range`.
    pub fn sessions_in_range(&self, ns: &Namespace, range: &KeyRange) -> Vec<MigratedSession> {
        let sessions = self.sessions.lock();
        let mut out = Vec::new();
        for (lsid, rec) in sessions.iter() {
            let statements: Vec<(StmtId, StmtOutcome)> = rec
                .executed
                .iter()
                .filter(|(_, s)| s.ns == *ns && s.keys.iter().any(|k| range.contains(k)))
                .map(|(id, s)| (*id, s.outcome))
                .collect();
            if !statements.is_empty() {
                out.push(MigratedSession {
                    lsid: *lsid,
                    txn_number: rec.txn_number,
                    ns: ns.clone(),
                    statements,
                });
            }
        }
        out
    }

    /// Merge history received with a migrated chunk. Keys are not shipped,
    /// so these statements are not forwarded by a later migration.
    pub fn install_migrated(&self, migrated: &[MigratedSession]) {
        for s in migrated {
            for (stmt, outcome) in &s.statements {
                self.record(s.lsid, s.txn_number, *stmt, *outcome, &s.ns, Vec::new());
            }
        }
    }

    /// Replace the table with what `entries` imply. CRUD entries of a
    /// statement add up to its outcome; `sessionOutcomes` entries override.
    pub fn rebuild(
        &self,
        entries: &[OplogEntry],
        key_of: impl Fn(&Namespace, &Document) -> Option<ShardKey>,
    ) -> usize {
        let mut table: HashMap<Lsid, SessionRecord> = HashMap::new();
        for e in entries {
            let Some(txn) = &e.txn else { continue };
            let rec = table
                .entry(txn.lsid)
                .or_insert_with(|| SessionRecord::new(txn.txn_number));
            if txn.txn_number < rec.txn_number {
                continue;
            }
            if txn.txn_number > rec.txn_number {
                *rec = SessionRecord::new(txn.txn_number);
            }
            match &e.op {
                OplogOp::Crud(op) => {
                    let Some(&stmt) = txn.stmt_ids.first() else {
                        continue;
                    };
                    let s = rec.executed.entry(stmt).or_insert_with(|| ExecutedStmt {
                        outcome: StmtOutcome::default(),
                        ns: e.ns.clone(),
                        keys: Vec::new(),
                    });
                    s.outcome.n += 1;
                    if matches!(op, CrudOp::Update { .. }) {
                        s.outcome.n_modified += 1;
                    }
                    if let Some(key) = op.post_image().and_then(|d| key_of(&e.ns, d)) {
                        s.keys.push(key);
                    }
                }
                OplogOp::SessionOutcomes { outcomes } => {
                    for (stmt, outcome) in outcomes {
                        let s = rec.executed.entry(*stmt).or_insert_with(|| ExecutedStmt {
                            outcome: *outcome,
                            ns: e.ns.clone(),
                            keys: Vec::new(),
                        });
                        s.outcome = *outcome;
                    }
                }
                _ => {}
            }
        }
        let n = table.len();
        *self.sessions.lock() = table;
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        n
    }

    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The outcome a rebuild would derive from a statement's CRUD entries.
pub(crate) fn derived_outcome(ops: &[CrudOp]) -> StmtOutcome {
    let mut out = StmtOutcome::default();
    for op in ops {
        out.n += 1;
        if matches!(op, CrudOp::Update { .. }) {
            out.n_modified += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{KeyValue, LogicalTimestamp, ShardKeyPattern};
    use kestrel_repl::TxnInfo;
    use serde_json::json;

    fn entry(lsid: Lsid, txn: i64, stmt: StmtId, op: OplogOp) -> OplogEntry {
        OplogEntry {
            ts: LogicalTimestamp::new(1, stmt as u32),
            term: 1,
            ns: Namespace::new("app", "users"),
            uuid: None,
            op,
            txn: Some(TxnInfo {
                lsid,
                txn_number: TxnNumber(txn),
                stmt_ids: vec![stmt],
            }),
            from_migrate: false,
            wall_secs: 1,
        }
    }

    #[test]
    fn test_replay_and_too_old() {
        let cat = SessionCatalog::new();
        let lsid = Lsid::generate();
        let ns = Namespace::new("app", "users");
        cat.begin(lsid, TxnNumber(3)).unwrap();
        cat.record(lsid, TxnNumber(3), 0, StmtOutcome { n: 1, n_modified: 0 }, &ns, vec![]);
        assert_eq!(
            cat.executed(lsid, TxnNumber(3), 0).unwrap(),
            Some(StmtOutcome { n: 1, n_modified: 0 })
        );
        assert_eq!(cat.executed(lsid, TxnNumber(3), 1).unwrap(), None);
        assert!(cat.begin(lsid, TxnNumber(2)).is_err());
        cat.begin(lsid, TxnNumber(4)).unwrap();
        assert_eq!(cat.executed(lsid, TxnNumber(4), 0).unwrap(), None);
        assert_eq!(cat.replays(), 1);
    }

    #[test]
    fn test_rebuild_counts_crud_and_honours_explicit_outcomes() {
        let lsid = Lsid::generate();
        let doc = json!({"_id": 1, "k": 5}).as_object().cloned().unwrap();
        let entries = vec![
            entry(lsid, 1, 0, OplogOp::Crud(CrudOp::Insert { doc: doc.clone() })),
            entry(lsid, 1, 0, OplogOp::Crud(CrudOp::Insert { doc })),
            entry(
                lsid,
                1,
                1,
                OplogOp::SessionOutcomes {
                    outcomes: vec![(1, StmtOutcome { n: 1, n_modified: 0 })],
                },
            ),
        ];
        let pattern = ShardKeyPattern::ranged(&["k"]);
        let cat = SessionCatalog::new();
        assert_eq!(cat.rebuild(&entries, |_, d| pattern.extract(d)), 1);
        assert_eq!(
            cat.executed(lsid, TxnNumber(1), 0).unwrap(),
            Some(StmtOutcome { n: 2, n_modified: 0 })
        );
        assert_eq!(
            cat.executed(lsid, TxnNumber(1), 1).unwrap(),
            Some(StmtOutcome { n: 1, n_modified: 0 })
        );
        let range = KeyRange::new(
            ShardKey::single(KeyValue::Int(0)),
            ShardKey::single(KeyValue::Int(10)),
        );
        let moved = cat.sessions_in_range(&Namespace::new("app", "users"), &range);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].statements.len(), 1);
    }
}
