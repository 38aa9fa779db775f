//! Shard-side state of multi-statement transactions.
//!
//! A transaction reads at a fixed snapshot and buffers its writes in an
//! overlay until it commits. Every document it writes is locked against
//! other transactions and against ordinary writes; the first writer wins
//! and later ones fail with a write conflict. A prepared transaction keeps
//! its locks until the coordinator's decision arrives, and reads that would
//! observe its documents wait for that decision.
//!
//! Lock order: replica-set write lock, then this participant, then storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_common::error::TxnError;
use kestrel_common::{
    CollectionUuid, DocKey, Document, KestrelError, KestrelResult, LogicalTimestamp, Lsid,
    Namespace, ShardId, StmtId, TxnKey, TxnNumber, WriteConcern,
};
use kestrel_repl::{CrudOp, OplogDraft, OplogOp, ReplicaNode, ReplicaSet, TxnInfo, TxnOp};
use kestrel_storage::StorageNode;

use super::crud::SnapshotSource;
use crate::messages::TxnStatement;

type DocLock = (Namespace, DocKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    InProgress,
    Prepared(LogicalTimestamp),
    Committed,
    Aborted,
}

impl TxnState {
    fn name(&self) -> &'static str {
        match self {
            TxnState::InProgress => "in progress",
            TxnState::Prepared(_) => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

#[derive(Debug)]
struct ActiveTxn {
    read_ts: LogicalTimestamp,
    state: TxnState,
    ops: Vec<TxnOp>,
    stmt_ids: Vec<StmtId>,
    overlay: BTreeMap<DocLock, Option<Document>>,
    last_used: Instant,
}

impl ActiveTxn {
    fn new(read_ts: LogicalTimestamp) -> Self {
        Self {
            read_ts,
            state: TxnState::InProgress,
            ops: Vec::new(),
            stmt_ids: Vec::new(),
            overlay: BTreeMap::new(),
            last_used: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    txns: HashMap<TxnKey, ActiveTxn>,
    locks: HashMap<DocLock, TxnKey>,
    /// Outcome of transactions no longer held in `txns`.
    finished: HashMap<TxnKey, TxnState>,
    newest: HashMap<Lsid, TxnNumber>,
}

impl Inner {
    fn finish(&mut self, key: TxnKey, outcome: TxnState) {
        self.txns.remove(&key);
        self.locks.retain(|_, holder| *holder != key);
        self.finished.insert(key, outcome);
    }

    fn bump_newest(&mut self, key: TxnKey) {
        let n = self.newest.entry(key.lsid).or_insert(key.txn_number);
        if key.txn_number > *n {
            *n = key.txn_number;
        }
    }

    fn missing(&self, key: TxnKey) -> KestrelError {
        match self.finished.get(&key) {
            Some(state) if *state == TxnState::Committed => TxnError::InvalidState {
                key,
                state: state.name().into(),
                op: "continue".into(),
            }
            .into(),
            _ => TxnError::NoSuchTransaction(key).into(),
        }
    }
}

#[derive(Debug, Default)]
struct ParticipantMetrics {
    started: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    write_conflicts: AtomicU64,
    prepare_conflict_waits: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ParticipantSnapshot {
    pub open: usize,
    pub locks: usize,
    pub started: u64,
    pub prepared: u64,
    pub committed: u64,
    pub aborted: u64,
    pub write_conflicts: u64,
    pub prepare_conflict_waits: u64,
    pub expired: u64,
}

/// Mutable access to one in-progress transaction.
pub(crate) struct TxnWork<'a> {
    key: TxnKey,
    txn: &'a mut ActiveTxn,
    locks: &'a mut HashMap<DocLock, TxnKey>,
    conflicts: &'a AtomicU64,
}

impl TxnWork<'_> {
    pub fn read_ts(&self) -> LogicalTimestamp {
        self.txn.read_ts
    }

    /// The transaction's snapshot with its own writes applied.
    pub fn source<'s>(&'s self, storage: &'s StorageNode) -> SnapshotSource<'s> {
        SnapshotSource {
            storage,
            read_ts: self.txn.read_ts,
            overlay: &self.txn.overlay,
        }
    }

    /// Buffer one document write, taking its lock.
    pub fn stage(
        &mut self,
        storage: &StorageNode,
        ns: &Namespace,
        uuid: CollectionUuid,
        op: CrudOp,
    ) -> KestrelResult<()> {
        let id = op.doc_key()?;
        let lock = (ns.clone(), id.clone());
        let conflict = match self.locks.get(&lock) {
            Some(holder) => *holder != self.key,
            None => storage
                .latest_write_ts(ns, &id)
                .is_some_and(|ts| ts > self.txn.read_ts),
        };
        if conflict {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(TxnError::WriteConflict {
                ns: ns.to_string(),
                key: id.to_string(),
            }
            .into());
        }
        self.locks.insert(lock.clone(), self.key);
        self.txn.overlay.insert(lock, op.post_image().cloned());
        self.txn.ops.push(TxnOp {
            ns: ns.clone(),
            uuid,
            op,
        });
        Ok(())
    }

    pub fn add_statement(&mut self, stmt_id: StmtId) {
        if !self.txn.stmt_ids.contains(&stmt_id) {
            self.txn.stmt_ids.push(stmt_id);
        }
    }
}

pub struct TxnParticipant {
    shard: ShardId,
    inner: Mutex<Inner>,
    changed: Condvar,
    metrics: ParticipantMetrics,
}

impl std::fmt::Debug for TxnParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnParticipant")
            .field("shard", &self.shard)
            .field("open", &self.inner.lock().txns.len())
            .finish()
    }
}

fn txn_info(key: TxnKey, stmt_ids: &[StmtId]) -> TxnInfo {
    TxnInfo {
        lsid: key.lsid,
        txn_number: key.txn_number,
        stmt_ids: stmt_ids.to_vec(),
    }
}

fn txn_draft(op: OplogOp, key: TxnKey, stmt_ids: &[StmtId]) -> OplogDraft {
    OplogDraft::new(
        Namespace::database_command("admin"),
        None,
        op,
    ).with_txn(txn_info(key, stmt_ids))
}

impl TxnParticipant {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            metrics: ParticipantMetrics::default(),
        }
    }

    /// Admit a statement of `key`. The first statement a shard sees starts
    /// the transaction and aborts older unprepared ones on the same session.
    pub fn begin(&self, key: TxnKey, stmt: TxnStatement) -> KestrelResult<()> {
        let mut inner = self.inner.lock();
        if let Some(newest) = inner.newest.get(&key.lsid) {
            if key.txn_number < *newest {
                return Err(TxnError::TransactionTooOld {
                    requested: key.txn_number.0,
                    current: newest.0,
                }
                .into());
            }
        }
        if inner.finished.contains_key(&key) {
            return Err(inner.missing(key));
        }
        if let Some(txn) = inner.txns.get_mut(&key) {
            if txn.state != TxnState::InProgress {
                return Err(TxnError::InvalidState {
                    key,
                    state: txn.state.name().into(),
                    op: "run a statement".into(),
                }
                .into());
            }
            txn.last_used = Instant::now();
            return Ok(());
        }
        if !stmt.start {
            return Err(TxnError::NoSuchTransaction(key).into());
        }
        let older: Vec<(TxnKey, TxnState)> = inner
            .txns
            .iter()
            .filter(|(k, _)| k.lsid == key.lsid && k.txn_number < key.txn_number)
            .map(|(k, t)| (*k, t.state))
            .collect();
        for (k, state) in older {
            if let TxnState::Prepared(_) = state {
                return Err(TxnError::InvalidState {
                    key: k,
                    state: state.name().into(),
                    op: format!("start {key}"),
                }
                .into());
            }
            inner.finish(k, TxnState::Aborted);
            self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
        }
        inner
            .finished
            .retain(|k, _| k.lsid != key.lsid || k.txn_number >= key.txn_number);
        inner.bump_newest(key);
        inner.txns.insert(key, ActiveTxn::new(stmt.read_ts));
        self.metrics.started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            shard = %self.shard,
            txn = %key,
            read_ts = %stmt.read_ts,
            "transaction started",
        );
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    /// Run `f` against an in-progress transaction. Any error aborts it.
    pub(crate) fn with_active<R>(
        &self,
        key: TxnKey,
        f: impl FnOnce(&mut TxnWork<'_>) -> KestrelResult<R>,
    ) -> KestrelResult<R> {
        let mut inner = self.inner.lock();
        let result = {
            let Inner { txns, locks, .. } = &mut *inner;
            match txns.get_mut(&key) {
                Some(txn) if txn.state == TxnState::InProgress => {
                    txn.last_used = Instant::now();
                    let mut work = TxnWork {
                        key,
                        txn,
                        locks,
                        conflicts: &self.metrics.write_conflicts,
                    };
                    f(&mut work)
                }
                Some(txn) => {
                    return Err(TxnError::InvalidState {
                        key,
                        state: txn.state.name().into(),
                        op: "run a statement".into(),
                    }
                    .into())
                }
                None => return Err(inner.missing(key)),
            }
        };
        if let Err(e) = &result {
            tracing::debug!(
                shard = %self.shard,
                txn = %key,
                error = %e,
                "statement failed, aborting transaction",
            );
            inner.finish(key, TxnState::Aborted);
            self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
            drop(inner);
            self.changed.notify_all();
        }
        result
    }

    /// Make the transaction durable and undecided. Preparing again returns
    /// the original prepare timestamp.
    pub fn prepare(&self, key: TxnKey, rs: &ReplicaSet) -> KestrelResult<LogicalTimestamp> {
        let out = rs.write(|w| {
            let mut inner = self.inner.lock();
            let Some(txn) = inner.txns.get_mut(&key) else {
                return Err(inner.missing(key));
            };
            match txn.state {
                TxnState::Prepared(ts) => return Ok(ts),
                TxnState::InProgress => {}
                other => {
                    return Err(TxnError::InvalidState {
                        key,
                        state: other.name().into(),
                        op: "prepare".into(),
                    }
                    .into())
                }
            }
            let draft = txn_draft(
                OplogOp::ApplyOps {
                    ops: txn.ops.clone(),
                    prepare: true,
                },
                key,
                &txn.stmt_ids,
            );
            let optime = w.log(draft)?;
            txn.state = TxnState::Prepared(optime.ts);
            Ok(optime.ts)
        })?;
        if let Some(op) = out.last_optime {
            self.metrics.prepared.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                shard = %self.shard,
                txn = %key,
                prepare_ts = %out.value,
                "transaction prepared",
            );
            rs.wait_for(op, WriteConcern::Majority)?;
        }
        Ok(out.value)
    }

    /// Commit `key`. Prepared transactions need the coordinator's
    /// `commit_ts`; single-shard transactions commit without one. Committing
    /// twice is a no-op.
    pub fn commit(
        &self,
        key: TxnKey,
        commit_ts: Option<LogicalTimestamp>,
        rs: &ReplicaSet,
    ) -> KestrelResult<()> {
        let out = rs.write(|w| {
            let mut inner = self.inner.lock();
            match inner.finished.get(&key) {
                Some(TxnState::Committed) => return Ok(false),
                Some(_) => return Err(TxnError::NoSuchTransaction(key).into()),
                None => {}
            }
            let Some(txn) = inner.txns.get(&key) else {
                return Err(inner.missing(key));
            };
            match (txn.state, commit_ts) {
                (TxnState::Prepared(prepare_ts), Some(commit_ts)) => {
                    if commit_ts < prepare_ts {
                        return Err(KestrelError::BadValue(format!(
                            "commit timestamp {commit_ts} precedes prepare timestamp {prepare_ts}"
                        )));
                    }
                    w.log(txn_draft(
                        OplogOp::CommitTransaction {
                            commit_ts,
                            prepare_ts,
                        },
                        key,
                        &txn.stmt_ids,
                    ))?;
                }
                (TxnState::InProgress, None) => {
                    if !txn.ops.is_empty() {
                        w.log(txn_draft(
                            OplogOp::ApplyOps {
                                ops: txn.ops.clone(),
                                prepare: false,
                            },
                            key,
                            &txn.stmt_ids,
                        ))?;
                    }
                }
                (state, _) => {
                    let op = if commit_ts.is_some() {
                        "commit at a timestamp without preparing"
                    } else {
                        "commit without a commit timestamp"
                    };
                    return Err(TxnError::InvalidState {
                        key,
                        state: state.name().into(),
                        op: op.into(),
                    }
                    .into());
                }
            }
            inner.finish(key, TxnState::Committed);
            Ok(true)
        })?;
        if out.value {
            self.metrics.committed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(shard = %self.shard, txn = %key, "transaction committed");
            self.changed.notify_all();
        }
        if let Some(op) = out.last_optime {
            rs.wait_for(op, WriteConcern::Majority)?;
        }
        Ok(())
    }

    /// Abort `key`. Unknown transactions are recorded as aborted so that a
    /// late statement for them fails.
    pub fn abort(&self, key: TxnKey, rs: &ReplicaSet) -> KestrelResult<()> {
        let out = rs.write(|w| {
            let mut inner = self.inner.lock();
            match inner.finished.get(&key) {
                Some(TxnState::Committed) => {
                    return Err(TxnError::InvalidState {
                        key,
                        state: "committed".into(),
                        op: "abort".into(),
                    }
                    .into())
                }
                Some(_) => return Ok(false),
                None => {}
            }
            if let Some(txn) = inner.txns.get(&key) {
                if let TxnState::Prepared(_) = txn.state {
                    w.log(txn_draft(OplogOp::AbortTransaction, key, &txn.stmt_ids))?;
                }
            }
            inner.bump_newest(key);
            inner.finish(key, TxnState::Aborted);
            Ok(true)
        })?;
        if out.value {
            self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(shard = %self.shard, txn = %key, "transaction aborted");
            self.changed.notify_all();
        }
        if let Some(op) = out.last_optime {
            rs.wait_for(op, WriteConcern::Majority)?;
        }
        Ok(())
    }

    /// Rebuild after this shard's replica set elected a new primary.
    /// Decided transactions come from the oplog, prepared ones from the
    /// node's prepared table; unprepared ones died with the old primary.
    pub fn on_step_up(&self, node: &ReplicaNode) -> usize {
        let mut rebuilt = Inner::default();
        for e in node.oplog().entries() {
            let Some(info) = &e.txn else { continue };
            let key = info.key();
            rebuilt.bump_newest(key);
            match &e.op {
                OplogOp::ApplyOps { prepare: false, .. } | OplogOp::CommitTransaction { .. } => {
                    rebuilt.finished.insert(key, TxnState::Committed);
                }
                OplogOp::AbortTransaction => {
                    rebuilt.finished.insert(key, TxnState::Aborted);
                }
                _ => {}
            }
        }
        let prepared = node.prepared_txns();
        for p in &prepared {
            let mut txn = ActiveTxn::new(p.prepare_ts);
            txn.state = TxnState::Prepared(p.prepare_ts);
            txn.stmt_ids = p.stmt_ids.clone();
            for op in &p.ops {
                if let Ok(id) = op.op.doc_key() {
                    let lock = (op.ns.clone(), id);
                    rebuilt.locks.insert(lock.clone(), p.key);
                    txn.overlay.insert(lock, op.op.post_image().cloned());
                }
            }
            txn.ops = p.ops.clone();
            rebuilt.bump_newest(p.key);
            rebuilt.txns.insert(p.key, txn);
        }
        *self.inner.lock() = rebuilt;
        self.changed.notify_all();
        tracing::info!(
            shard = %self.shard,
            prepared = prepared.len(),
            "transaction state rebuilt on step-up",
        );
        prepared.len()
    }

    /// Abort unprepared transactions idle longer than `lifetime`.
    pub fn expire_idle(&self, lifetime: Duration) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<TxnKey> = inner
            .txns
            .iter()
            .filter(|(_, t)| t.state == TxnState::InProgress && t.last_used.elapsed() > lifetime)
            .map(|(k, _)| *k)
            .collect();
        for k in &stale {
            tracing::info!(shard = %self.shard, txn = %k, "aborting expired transaction");
            inner.finish(*k, TxnState::Aborted);
        }
        drop(inner);
        if !stale.is_empty() {
            self.metrics
                .expired
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            self.metrics
                .aborted
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            self.changed.notify_all();
        }
        stale.len()
    }

    /// Abort every unprepared transaction that wrote to `ns`. Returns how
    /// many were aborted.
    pub fn abort_active_on(&self, ns: &Namespace) -> usize {
        let mut inner = self.inner.lock();
        let victims: Vec<TxnKey> = inner
            .txns
            .iter()
            .filter(|(_, t)| t.state == TxnState::InProgress && t.ops.iter().any(|o| o.ns == *ns))
            .map(|(k, _)| *k)
            .collect();
        for k in &victims {
            inner.finish(*k, TxnState::Aborted);
        }
        drop(inner);
        if !victims.is_empty() {
            self.metrics
                .aborted
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            self.changed.notify_all();
        }
        victims.len()
    }

    /// Prepared transactions with writes to `ns`.
    pub fn prepared_on(&self, ns: &Namespace) -> usize {
        self.inner
            .lock()
            .txns
            .values()
            .filter(|t| {
                matches!(t.state, TxnState::Prepared(_)) && t.ops.iter().any(|o| o.ns == *ns)
            })
            .count()
    }

    /// Wait until no prepared transaction on `ns` writes to a document a
    /// read for `pred` at `read_ts` could see.
    pub fn wait_prepared(
        &self,
        ns: &Namespace,
        read_ts: LogicalTimestamp,
        pred: &dyn Fn(&Document) -> bool,
        storage: &StorageNode,
        deadline: Instant,
    ) -> KestrelResult<()> {
        let mut inner = self.inner.lock();
        let mut waited = false;
        loop {
            let blocking = inner.txns.values().find_map(|t| match t.state {
                TxnState::Prepared(ts) if ts <= read_ts => t.ops.iter().find_map(|o| {
                    if o.ns != *ns {
                        return None;
                    }
                    let id = o.op.doc_key().ok()?;
                    let hit = o.op.post_image().is_some_and(|d| pred(d))
                        || storage.get_latest(ns, &id).is_some_and(|d| pred(&d));
                    hit.then_some(id)
                }),
                _ => None,
            });
            let Some(id) = blocking else { return Ok(()) };
            if !waited {
                waited = true;
                self.metrics
                    .prepare_conflict_waits
                    .fetch_add(1, Ordering::Relaxed);
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return Err(TxnError::PrepareConflict {
                    ns: ns.to_string(),
                    key: id.to_string(),
                }
                .into());
            }
        }
    }

    /// Transaction holding the lock on a document, if any.
    pub fn lock_holder(&self, ns: &Namespace, id: &DocKey) -> Option<TxnKey> {
        self.inner.lock().locks.get(&(ns.clone(), id.clone())).copied()
    }

    /// Wait until no transaction holds the lock on a document.
    pub fn wait_unlocked(
        &self,
        ns: &Namespace,
        id: &DocKey,
        deadline: Instant,
    ) -> KestrelResult<()> {
        let lock = (ns.clone(), id.clone());
        let mut inner = self.inner.lock();
        while inner.locks.contains_key(&lock) {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                self.metrics.write_conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(TxnError::WriteConflict {
                    ns: ns.to_string(),
                    key: id.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn state_of(&self, key: TxnKey) -> Option<TxnState> {
        let inner = self.inner.lock();
        inner
            .txns
            .get(&key)
            .map(|t| t.state)
            .or_else(|| inner.finished.get(&key).copied())
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        let inner = self.inner.lock();
        ParticipantSnapshot {
            open: inner.txns.len(),
            locks: inner.locks.len(),
            started: self.metrics.started.load(Ordering::Relaxed),
            prepared: self.metrics.prepared.load(Ordering::Relaxed),
            committed: self.metrics.committed.load(Ordering::Relaxed),
            aborted: self.metrics.aborted.load(Ordering::Relaxed),
            write_conflicts: self.metrics.write_conflicts.load(Ordering::Relaxed),
            prepare_conflict_waits: self.metrics.prepare_conflict_waits.load(Ordering::Relaxed),
            expired: self.metrics.expired.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::{ClusterClock, KeyValue, ManualWallClock};
    use kestrel_storage::CollectionOptions;
    use serde_json::json;

    struct Fixture {
        rs: Arc<ReplicaSet>,
        ns: Namespace,
        uuid: CollectionUuid,
        p: TxnParticipant,
    }

    fn fixture() -> Fixture {
        let clock = ClusterClock::new(ManualWallClock::new(100));
        let rs = ReplicaSet::new(
            "shard0",
            1,
            clock,
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let ns = Namespace::new("app", "accounts");
        let uuid = CollectionUuid::generate();
        rs.write_entry(
            OplogDraft::new(
                ns.clone(),
                Some(uuid),
                OplogOp::Create { options: CollectionOptions::default() },
            ),
            WriteConcern::One,
        )
        .unwrap();
        Fixture {
            rs,
            ns,
            uuid,
            p: TxnParticipant::new(ShardId(0)),
        }
    }

    fn insert(id: i64) -> CrudOp {
        CrudOp::Insert {
            doc: json!({"_id": id, "bal": 10}).as_object().cloned().unwrap(),
        }
    }

    fn start(f: &Fixture, n: i64, lsid: Lsid) -> TxnKey {
        let key = TxnKey::new(lsid, TxnNumber(n));
        f.p.begin(
            key,
            TxnStatement {
                read_ts: f.rs.clock().now(),
                start: true,
            },
        )
        .unwrap();
        key
    }

    #[test]
    fn test_first_writer_wins_and_loser_is_aborted() {
        let f = fixture();
        let storage = f.rs.primary_storage().unwrap();
        let a = start(&f, 1, Lsid::generate());
        let b = start(&f, 1, Lsid::generate());
        f.p.with_active(a, |w| w.stage(&storage, &f.ns, f.uuid, insert(1)))
            .unwrap();
        let err = f
            .p
            .with_active(b, |w| w.stage(&storage, &f.ns, f.uuid, insert(1)))
            .unwrap_err();
        assert!(err.has_transient_transaction_label());
        assert_eq!(f.p.state_of(b), Some(TxnState::Aborted));
        f.p.commit(a, None, &f.rs).unwrap();
        assert!(storage.get_latest(&f.ns, &DocKey(KeyValue::Int(1))).is_some());
        f.p.commit(a, None, &f.rs).unwrap();
        assert_eq!(f.p.snapshot().committed, 1);
    }

    #[test]
    fn test_prepared_commit_applies_at_commit_ts_and_releases_locks() {
        let f = fixture();
        let storage = f.rs.primary_storage().unwrap();
        let key = start(&f, 1, Lsid::generate());
        f.p.with_active(key, |w| w.stage(&storage, &f.ns, f.uuid, insert(5)))
            .unwrap();
        let prepare_ts = f.p.prepare(key, &f.rs).unwrap();
        assert_eq!(f.p.prepare(key, &f.rs).unwrap(), prepare_ts);
        let id = DocKey(KeyValue::Int(5));
        assert_eq!(f.p.lock_holder(&f.ns, &id), Some(key));

        let err = f.p.commit(key, None, &f.rs).unwrap_err();
        assert!(err.is_user_error());

        let commit_ts = f.rs.clock().tick();
        f.p.commit(key, Some(commit_ts), &f.rs).unwrap();
        assert!(f.p.lock_holder(&f.ns, &id).is_none());
        assert!(storage.get(&f.ns, &id, commit_ts.prev()).unwrap().is_none());
        assert!(storage.get(&f.ns, &id, commit_ts).unwrap().is_some());
    }

    #[test]
    fn test_read_waits_on_prepared_then_times_out() {
        let f = fixture();
        let storage = f.rs.primary_storage().unwrap();
        let key = start(&f, 1, Lsid::generate());
        f.p.with_active(key, |w| w.stage(&storage, &f.ns, f.uuid, insert(5)))
            .unwrap();
        f.p.prepare(key, &f.rs).unwrap();
        let read_ts = f.rs.clock().now();
        let err = f
            .p
            .wait_prepared(
                &f.ns,
                read_ts,
                &|_| true,
                &storage,
                Instant::now() + Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(err, KestrelError::Txn(TxnError::PrepareConflict { .. })));
        f.p.wait_prepared(
            &f.ns,
            read_ts,
            &|d| d.get("_id") == Some(&json!(6)),
            &storage,
            Instant::now() + Duration::from_millis(20),
        )
        .unwrap();
    }

    #[test]
    fn test_newer_txn_number_aborts_older_and_old_numbers_are_rejected() {
        let f = fixture();
        let lsid = Lsid::generate();
        let old = start(&f, 1, lsid);
        let new = start(&f, 2, lsid);
        assert_eq!(f.p.state_of(old), None);
        let err = f
            .p
            .begin(
                old,
                TxnStatement {
                    read_ts: f.rs.clock().now(),
                    start: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, KestrelError::Txn(TxnError::TransactionTooOld { .. })));
        assert_eq!(f.p.state_of(new), Some(TxnState::InProgress));
        assert_eq!(f.p.expire_idle(Duration::ZERO), 1);
        assert_eq!(f.p.state_of(new), Some(TxnState::Aborted));
    }

    #[test]
    fn test_step_up_restores_prepared_and_drops_unprepared() {
        let f = fixture();
        let storage = f.rs.primary_storage().unwrap();
        let prepared = start(&f, 1, Lsid::generate());
        let open = start(&f, 1, Lsid::generate());
        f.p.with_active(prepared, |w| w.stage(&storage, &f.ns, f.uuid, insert(1)))
            .unwrap();
        f.p.with_active(open, |w| w.stage(&storage, &f.ns, f.uuid, insert(2)))
            .unwrap();
        f.p.prepare(prepared, &f.rs).unwrap();

        let fresh = TxnParticipant::new(ShardId(0));
        assert_eq!(fresh.on_step_up(&f.rs.primary().unwrap()), 1);
        assert!(matches!(fresh.state_of(prepared), Some(TxnState::Prepared(_))));
        assert_eq!(fresh.state_of(open), None);
        assert_eq!(fresh.lock_holder(&f.ns, &DocKey(KeyValue::Int(1))), Some(prepared));
        fresh.abort(prepared, &f.rs).unwrap();
        assert_eq!(fresh.state_of(prepared), Some(TxnState::Aborted));
        assert!(f.rs.primary().unwrap().prepared_txns().is_empty());
    }
}
