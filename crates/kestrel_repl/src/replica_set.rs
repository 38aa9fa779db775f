//! Replica-set consensus.
//!
//! One member is primary. The primary issues timestamps from the set's
//! [`ClusterClock`], writes oplog entries and applies them under a single
//! write lock, so oplog order equals timestamp order. Secondaries pull
//! batches and replay them. The majority commit point is the newest OpTime
//! applied by a majority of the configured members; it never regresses.
//!
//! Failover follows the vote rules in [`crate::election`]. A member that
//! rejoins with entries the new primary never saw rolls them back to the
//! common point and refetches what plain truncation cannot restore.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use kestrel_common::config::{ReplicationConfig, StorageConfig};
use kestrel_common::error::ReplError;
use kestrel_common::{
    ClusterClock, KestrelError, KestrelResult, LogicalTimestamp, Namespace, NodeId, OpTime,
    WriteConcern,
};
use kestrel_storage::StorageNode;

use crate::applier::{apply_entry, rebuild_prepared};
use crate::election::{majority_of, Lease, VoteRequest};
use crate::node::{MemberState, ReplicaNode};
use crate::oplog::{OplogBatch, OplogDraft, OplogEntry, OplogOp};

#[derive(Debug, Default)]
struct ReplSetMetrics {
    entries_written: AtomicU64,
    entries_replicated: AtomicU64,
    elections: AtomicU64,
    rollbacks: AtomicU64,
    rolled_back_entries: AtomicU64,
    resyncs: AtomicU64,
    write_concern_timeouts: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ReplSetSnapshot {
    pub name: String,
    pub term: u64,
    pub primary: Option<NodeId>,
    pub majority_point: OpTime,
    pub entries_written: u64,
    pub entries_replicated: u64,
    pub elections: u64,
    pub rollbacks: u64,
    pub rolled_back_entries: u64,
    pub resyncs: u64,
    pub write_concern_timeouts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    pub id: NodeId,
    pub state: MemberState,
    pub term: u64,
    pub last_applied: OpTime,
}

/// Result of [`ReplicaSet::write`]: the closure's value and the OpTime of the
/// last entry it logged, if any.
#[derive(Debug)]
pub struct WriteOutcome<R> {
    pub value: R,
    pub last_optime: Option<OpTime>,
}

pub struct ReplicaSet {
    name: String,
    nodes: Vec<Arc<ReplicaNode>>,
    clock: Arc<ClusterClock>,
    repl: ReplicationConfig,
    storage_cfg: StorageConfig,
    /// Serializes timestamp issue + apply + append on the primary.
    write_lock: Mutex<()>,
    /// Serializes secondary pulls.
    sync_lock: Mutex<()>,
    majority: RwLock<OpTime>,
    metrics: ReplSetMetrics,
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("name", &self.name)
            .field("members", &self.nodes.len())
            .field("majority", &*self.majority.read())
            .finish()
    }
}

impl ReplicaSet {
    /// Build a set of `members` nodes and elect the first one.
    pub fn new(
        name: impl Into<String>,
        members: usize,
        clock: Arc<ClusterClock>,
        repl: ReplicationConfig,
        storage_cfg: StorageConfig,
    ) -> KestrelResult<Arc<Self>> {
        let name = name.into();
        if members == 0 {
            return Err(KestrelError::Config(format!("{name}: a replica set needs members")));
        }
        let nodes = (0..members as u64)
            .map(|i| ReplicaNode::new(NodeId(i), &name))
            .collect();
        let set = Arc::new(Self {
            name,
            nodes,
            clock,
            repl,
            storage_cfg,
            write_lock: Mutex::new(()),
            sync_lock: Mutex::new(()),
            majority: RwLock::new(OpTime::default()),
            metrics: ReplSetMetrics::default(),
        });
        set.elect(NodeId(0))?;
        Ok(set)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        &self.clock
    }

    pub fn nodes(&self) -> &[Arc<ReplicaNode>] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> KestrelResult<Arc<ReplicaNode>> {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .cloned()
            .ok_or_else(|| KestrelError::BadValue(format!("{}: no member {id}", self.name)))
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn primary(&self) -> KestrelResult<Arc<ReplicaNode>> {
        self.nodes
            .iter()
            .filter(|n| n.is_primary())
            .max_by_key(|n| n.term())
            .cloned()
            .ok_or_else(|| ReplError::NoPrimary(self.name.clone()).into())
    }

    /// Storage of the current primary.
    pub fn primary_storage(&self) -> KestrelResult<Arc<StorageNode>> {
        Ok(Arc::clone(self.primary()?.storage()))
    }

    /// Highest term any reachable member has seen.
    pub fn term(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|n| n.is_up())
            .map(|n| n.term())
            .max()
            .unwrap_or(0)
    }

    pub fn majority_point(&self) -> OpTime {
        *self.majority.read()
    }

    pub fn status(&self) -> Vec<MemberStatus> {
        self.nodes
            .iter()
            .map(|n| MemberStatus {
                id: n.id(),
                state: n.member_state(),
                term: n.term(),
                last_applied: n.last_applied(),
            })
            .collect()
    }

    // ── Writes ──

    /// Run `f` on the primary under the set's write lock. Entries it logs are
    /// applied and appended in timestamp order.
    pub fn write<R>(
        &self,
        f: impl FnOnce(&mut PrimaryWrite<'_>) -> KestrelResult<R>,
    ) -> KestrelResult<WriteOutcome<R>> {
        let _guard = self.write_lock.lock();
        let primary = self.primary()?;
        if !primary.can_accept_writes() && !(self.heartbeat() && primary.can_accept_writes()) {
            return Err(ReplError::NotWritablePrimary {
                node: primary.id(),
                term: primary.term(),
            }
            .into());
        }
        let mut ctx = PrimaryWrite {
            set: self,
            node: &primary,
            term: primary.term(),
            last: None,
        };
        let value = f(&mut ctx)?;
        let last_optime = ctx.last;
        if last_optime.is_some() {
            self.recompute_majority(&primary);
        }
        Ok(WriteOutcome { value, last_optime })
    }

    /// Log a single entry and wait for `wc`.
    pub fn write_entry(&self, draft: OplogDraft, wc: WriteConcern) -> KestrelResult<OpTime> {
        let out = self.write(|w| w.log(draft))?;
        self.wait_for_write_concern(out.value, wc, self.repl.write_concern_timeout())?;
        Ok(out.value)
    }

    /// Run `f` like [`ReplicaSet::write`], then wait for `wc` on whatever it
    /// logged using the configured timeout.
    pub fn write_with_concern<R>(
        &self,
        wc: WriteConcern,
        f: impl FnOnce(&mut PrimaryWrite<'_>) -> KestrelResult<R>,
    ) -> KestrelResult<R> {
        let out = self.write(f)?;
        if let Some(op) = out.last_optime {
            self.wait_for(op, wc)?;
        }
        Ok(out.value)
    }

    /// [`ReplicaSet::wait_for_write_concern`] with the configured timeout.
    pub fn wait_for(&self, optime: OpTime, wc: WriteConcern) -> KestrelResult<()> {
        self.wait_for_write_concern(optime, wc, self.repl.write_concern_timeout())
    }

    /// Block until `optime` satisfies `wc`, driving replication meanwhile.
    pub fn wait_for_write_concern(
        &self,
        optime: OpTime,
        wc: WriteConcern,
        timeout: Duration,
    ) -> KestrelResult<()> {
        if wc == WriteConcern::One {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_majority_committed(optime) {
                return Ok(());
            }
            self.replicate_once();
            if self.is_majority_committed(optime) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.metrics
                    .write_concern_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(ReplError::WriteConcernTimeout {
                    optime,
                    majority: self.majority_point(),
                }
                .into());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_majority_committed(&self, optime: OpTime) -> bool {
        if self.majority_point() < optime {
            return false;
        }
        // An OpTime from a rolled-back branch can sort below the majority point.
        match self.primary() {
            Ok(p) => match p.oplog().first_ts() {
                Some(first) if optime.ts >= first => p.oplog().contains(optime),
                _ => true,
            },
            Err(_) => false,
        }
    }

    // ── Replication ──

    /// Ship one batch to every reachable secondary. Returns entries applied.
    pub fn replicate_once(&self) -> usize {
        let _sync = self.sync_lock.lock();
        let Ok(primary) = self.primary() else {
            return 0;
        };
        let term = primary.term();
        let mut applied = 0;
        for node in self.nodes.iter().filter(|n| n.id() != primary.id() && n.is_up()) {
            node.with_voter(|v| v.observe_term(term));
            if node.is_primary() {
                tracing::info!(
                    set = %self.name,
                    node = %node.id(),
                    term,
                    "stale primary stepping down",
                );
                node.set_member_state(MemberState::Secondary);
            }
            let last = node.last_applied();
            if last != OpTime::default() && !primary.oplog().contains(last) {
                if let Err(e) = self.resolve_divergence(&primary, node) {
                    tracing::warn!(
                        set = %self.name,
                        node = %node.id(),
                        error = %e,
                        "rollback failed",
                    );
                    continue;
                }
            }
            applied += self.pull_batch(&primary, node);
        }
        if applied > 0 {
            self.metrics
                .entries_replicated
                .fetch_add(applied as u64, Ordering::Relaxed);
        }
        self.recompute_majority(&primary);
        applied
    }

    fn pull_batch(&self, primary: &ReplicaNode, node: &ReplicaNode) -> usize {
        let batch = OplogBatch::new(
            primary
                .oplog()
                .read_after(node.last_applied().ts, self.repl.batch_size),
        );
        if batch.is_empty() {
            return 0;
        }
        if let Err(e) = batch.verify() {
            tracing::warn!(
                set = %self.name,
                node = %node.id(),
                error = %e,
                "discarding oplog batch",
            );
            return 0;
        }
        let mut applied = 0;
        for entry in &batch.entries {
            let res = apply_entry(node, entry).and_then(|_| node.oplog().append(entry.clone()));
            if let Err(e) = res {
                tracing::warn!(
                    set = %self.name,
                    node = %node.id(),
                    ts = %entry.ts,
                    error = %e,
                    "secondary apply failed",
                );
                break;
            }
            node.set_last_applied(entry.optime());
            applied += 1;
        }
        applied
    }

    /// Drive replication until every reachable secondary has caught up.
    pub fn sync_all(&self) {
        while self.replicate_once() > 0 {}
    }

    fn recompute_majority(&self, primary: &ReplicaNode) {
        let head = primary.last_applied();
        let mut positions: Vec<OpTime> = self
            .nodes
            .iter()
            .map(|n| {
                let applied = n.last_applied();
                if n.id() == primary.id() {
                    applied
                } else if applied == OpTime::default() || primary.oplog().contains(applied) {
                    applied.min(head)
                } else {
                    OpTime::default()
                }
            })
            .collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = positions[majority_of(self.nodes.len()) - 1];
        let mut majority = self.majority.write();
        if candidate > *majority {
            *majority = candidate;
        }
    }

    // ── Rollback ──

    fn resolve_divergence(&self, primary: &ReplicaNode, node: &ReplicaNode) -> KestrelResult<()> {
        match self.find_common_point(primary, node) {
            Ok(common) => self.rollback(primary, node, common),
            Err(e) => {
                tracing::warn!(
                    set = %self.name,
                    node = %node.id(),
                    error = %e,
                    "falling back to initial sync",
                );
                self.resync(primary, node);
                Ok(())
            }
        }
    }

    fn find_common_point(
        &self,
        primary: &ReplicaNode,
        node: &ReplicaNode,
    ) -> KestrelResult<OpTime> {
        node.oplog()
            .entries()
            .iter()
            .rev()
            .map(OplogEntry::optime)
            .find(|op| primary.oplog().contains(*op))
            .ok_or_else(|| ReplError::NoCommonPoint { node: node.id() }.into())
    }

    /// Undo `node`'s history after `common` and make it consistent with the
    /// sync source as of `common`.
    fn rollback(
        &self,
        primary: &ReplicaNode,
        node: &ReplicaNode,
        common: OpTime,
    ) -> KestrelResult<()> {
        node.set_member_state(MemberState::Rollback);
        let removed = node.oplog().truncate_after(common.ts);
        node.storage().truncate_after(common.ts);

        // Collection-level operations are not captured by version chains.
        let mut refetch: HashSet<Namespace> = HashSet::new();
        for e in &removed {
            match &e.op {
                OplogOp::Create { .. } => {
                    let on_source = primary.storage().collection_info(&e.ns);
                    if on_source.map(|i| Some(i.uuid)) != Some(e.uuid) {
                        node.storage().drop_collection(&e.ns);
                    }
                }
                OplogOp::Drop => {
                    refetch.insert(e.ns.clone());
                }
                OplogOp::DropDatabase => {
                    for info in primary.storage().list_collections() {
                        if info.ns.db == e.ns.db {
                            refetch.insert(info.ns);
                        }
                    }
                }
                OplogOp::CollMod { .. } => {
                    if let Some(info) = primary.storage().collection_info(&e.ns) {
                        node.storage().set_collection_options(&e.ns, info.options)?;
                    }
                }
                _ => {}
            }
        }
        for ns in &refetch {
            refetch_collection(primary.storage(), node.storage(), ns, common.ts)?;
        }

        rebuild_prepared(node);
        node.set_last_applied(common);
        node.with_voter(|v| v.observe_term(primary.term()));
        node.set_member_state(MemberState::Secondary);

        self.metrics.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .rolled_back_entries
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        kestrel_observability::record_rollback(&self.name, removed.len());
        tracing::warn!(
            set = %self.name,
            node = %node.id(),
            common = %common,
            entries = removed.len(),
            refetched_collections = refetch.len(),
            "rolled back divergent oplog entries",
        );
        Ok(())
    }

    /// Initial sync: replace `node`'s data and oplog with the primary's.
    fn resync(&self, primary: &ReplicaNode, node: &ReplicaNode) {
        let _guard = self.write_lock.lock();
        node.set_member_state(MemberState::Rollback);
        node.storage().copy_from(primary.storage());
        node.oplog().reset_from(primary.oplog());
        rebuild_prepared(node);
        node.set_last_applied(primary.last_applied());
        node.with_voter(|v| v.observe_term(primary.term()));
        node.set_member_state(MemberState::Secondary);
        self.metrics.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    // ── Elections ──

    /// Run an election for `candidate`.
    pub fn elect(&self, candidate: NodeId) -> KestrelResult<u64> {
        let node = self.node(candidate)?;
        if !node.is_up() {
            return Err(ReplError::NodeDown(candidate).into());
        }
        let term = self.term() + 1;
        let req = VoteRequest {
            term,
            candidate,
            last_optime: node.last_applied(),
        };
        let votes = self
            .nodes
            .iter()
            .filter(|n| n.is_up() && n.member_state() != MemberState::Rollback)
            .filter(|n| {
                let own = n.last_applied();
                n.with_voter(|v| v.consider(&req, own))
            })
            .count();
        let needed = majority_of(self.nodes.len());
        let won = votes >= needed;
        kestrel_observability::record_election(&self.name, won);
        if !won {
            tracing::info!(set = %self.name, %candidate, term, votes, needed, "election lost");
            return Err(ReplError::ElectionFailed {
                term,
                votes,
                needed,
            }
            .into());
        }

        {
            let _guard = self.write_lock.lock();
            for other in self.nodes.iter().filter(|n| n.id() != candidate) {
                if other.is_up() {
                    other.with_voter(|v| v.observe_term(term));
                    if other.is_primary() {
                        other.set_member_state(MemberState::Secondary);
                    }
                }
            }
            node.set_member_state(MemberState::Primary);
            node.renew_lease(Lease::grant(self.repl.lease()));
            self.clock.advance(node.last_applied().ts);
        }
        self.metrics.elections.fetch_add(1, Ordering::Relaxed);
        tracing::info!(set = %self.name, %candidate, term, votes, "elected primary");

        self.write(|w| {
            w.log(OplogDraft::new(
                Namespace::new("admin", "$cmd"),
                None,
                OplogOp::Noop {
                    msg: format!("new primary {candidate} in term {term}"),
                },
            ))
        })?;
        Ok(term)
    }

    /// Elect the most up-to-date reachable member.
    pub fn step_up_best(&self) -> KestrelResult<NodeId> {
        let mut candidates: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.is_up() && n.member_state() != MemberState::Rollback)
            .cloned()
            .collect();
        candidates.sort_by_key(|n| std::cmp::Reverse(n.last_applied()));
        let mut last_err = KestrelError::from(ReplError::NoPrimary(self.name.clone()));
        for c in candidates {
            match self.elect(c.id()) {
                Ok(_) => return Ok(c.id()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub fn step_down(&self, id: NodeId) -> KestrelResult<()> {
        let node = self.node(id)?;
        if node.is_primary() {
            let _guard = self.write_lock.lock();
            node.set_member_state(MemberState::Secondary);
            tracing::info!(set = %self.name, node = %id, "stepped down");
        }
        Ok(())
    }

    /// Renew the primary's lease if a majority is reachable; a primary whose
    /// lease has lapsed without one steps down.
    pub fn heartbeat(&self) -> bool {
        let Ok(primary) = self.primary() else {
            return false;
        };
        let reachable = self.nodes.iter().filter(|n| n.is_up()).count();
        if reachable >= majority_of(self.nodes.len()) {
            primary.renew_lease(Lease::grant(self.repl.lease()));
            let slowest = self
                .nodes
                .iter()
                .filter(|n| n.is_up())
                .map(|n| n.last_applied().ts)
                .min()
                .unwrap_or_default();
            let lag = primary.oplog().read_after(slowest, 10_000).len();
            kestrel_observability::record_replication_lag(&self.name, lag as u64);
            true
        } else {
            if !primary.can_accept_writes() {
                tracing::warn!(
                    set = %self.name,
                    node = %primary.id(),
                    "lost majority, stepping down",
                );
                primary.set_member_state(MemberState::Secondary);
            }
            false
        }
    }

    // ── Fault simulation ──

    /// Mark a member crashed. Its storage and oplog survive for `restart`.
    pub fn crash(&self, id: NodeId) -> KestrelResult<()> {
        let node = self.node(id)?;
        node.set_member_state(MemberState::Down);
        tracing::warn!(set = %self.name, node = %id, "member down");
        Ok(())
    }

    pub fn restart(&self, id: NodeId) -> KestrelResult<()> {
        let node = self.node(id)?;
        if node.member_state() == MemberState::Down {
            node.set_member_state(MemberState::Secondary);
            tracing::info!(set = %self.name, node = %id, "member restarted");
        }
        Ok(())
    }

    // ── Readers ──

    /// Majority-committed oplog entries after `after`, from the primary.
    pub fn read_committed_oplog(
        &self,
        after: LogicalTimestamp,
        limit: usize,
    ) -> KestrelResult<Vec<OplogEntry>> {
        let primary = self.primary()?;
        Ok(primary
            .oplog()
            .read_range(after, self.majority_point().ts, limit))
    }

    /// True if the primary retains every entry after `ts`.
    pub fn has_history_after(&self, ts: LogicalTimestamp) -> KestrelResult<bool> {
        Ok(self.primary()?.oplog().has_history_after(ts))
    }

    pub fn oldest_oplog_ts(&self) -> KestrelResult<Option<LogicalTimestamp>> {
        Ok(self.primary()?.oplog().first_ts())
    }

    /// Timestamp below which no new committed entry will ever appear: all
    /// entries up to it are majority-committed, and later writes tick past it.
    /// Held back by the oldest prepared transaction.
    pub fn committed_watermark(&self) -> KestrelResult<LogicalTimestamp> {
        let _guard = self.write_lock.lock();
        let primary = self.primary()?;
        let majority = self.majority_point();
        let mut watermark = if majority >= primary.last_applied() {
            self.clock.now()
        } else {
            majority.ts
        };
        if let Some(p) = primary.oldest_prepare_ts() {
            watermark = watermark.min(p.prev());
        }
        Ok(watermark)
    }

    // ── History ──

    /// Advance every member's oldest readable timestamp and truncate the
    /// oplog head. Neither moves past the majority point or the oldest
    /// prepared transaction.
    pub fn advance_history(&self) {
        let majority = self.majority_point().ts;
        let oldest = LogicalTimestamp::new(
            majority.secs.saturating_sub(self.storage_cfg.history_window_secs),
            0,
        );
        for node in &self.nodes {
            let pin = node
                .oldest_prepare_ts()
                .map_or(majority, |p| p.min(majority));
            node.storage().set_oldest_timestamp(oldest.min(pin));
            if self.storage_cfg.oplog_max_entries > 0 {
                let removed = node
                    .oplog()
                    .truncate_head(self.storage_cfg.oplog_max_entries, Some(pin));
                if removed > 0 {
                    tracing::debug!(
                        set = %self.name,
                        node = %node.id(),
                        removed,
                        "oplog head truncated",
                    );
                }
            }
        }
    }

    pub fn snapshot(&self) -> ReplSetSnapshot {
        ReplSetSnapshot {
            name: self.name.clone(),
            term: self.term(),
            primary: self.primary().ok().map(|p| p.id()),
            majority_point: self.majority_point(),
            entries_written: self.metrics.entries_written.load(Ordering::Relaxed),
            entries_replicated: self.metrics.entries_replicated.load(Ordering::Relaxed),
            elections: self.metrics.elections.load(Ordering::Relaxed),
            rollbacks: self.metrics.rollbacks.load(Ordering::Relaxed),
            rolled_back_entries: self.metrics.rolled_back_entries.load(Ordering::Relaxed),
            resyncs: self.metrics.resyncs.load(Ordering::Relaxed),
            write_concern_timeouts: self.metrics.write_concern_timeouts.load(Ordering::Relaxed),
        }
    }
}

fn refetch_collection(
    source: &StorageNode,
    target: &StorageNode,
    ns: &Namespace,
    at: LogicalTimestamp,
) -> KestrelResult<()> {
    let Some(info) = source.collection_info(ns) else {
        target.drop_collection(ns);
        return Ok(());
    };
    target.drop_collection(ns);
    target.create_collection(ns, info.uuid, info.options, info.created_at)?;
    let docs = match source.scan(ns, at) {
        Ok(docs) => docs,
        Err(_) => source.scan_latest_where(ns, |_| true),
    };
    for doc in docs {
        target.put(ns, doc, at)?;
    }
    Ok(())
}

/// Write context handed to [`ReplicaSet::write`] closures.
pub struct PrimaryWrite<'a> {
    set: &'a ReplicaSet,
    node: &'a Arc<ReplicaNode>,
    term: u64,
    last: Option<OpTime>,
}

impl PrimaryWrite<'_> {
    pub fn node(&self) -> &Arc<ReplicaNode> {
        self.node
    }

    pub fn storage(&self) -> &Arc<StorageNode> {
        self.node.storage()
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn last_optime(&self) -> Option<OpTime> {
        self.last
    }

    /// Stamp, apply and append one entry.
    pub fn log(&mut self, draft: OplogDraft) -> KestrelResult<OpTime> {
        let clock = &self.set.clock;
        let entry = OplogEntry {
            ts: clock.tick(),
            term: self.term,
            ns: draft.ns,
            uuid: draft.uuid,
            op: draft.op,
            txn: draft.txn,
            from_migrate: draft.from_migrate,
            wall_secs: clock.wall_secs(),
        };
        let optime = entry.optime();
        apply_entry(self.node, &entry)?;
        self.node.oplog().append(entry)?;
        self.node.set_last_applied(optime);
        self.last = Some(optime);
        self.set
            .metrics
            .entries_written
            .fetch_add(1, Ordering::Relaxed);
        kestrel_observability::record_oplog_append(&self.set.name, 1);
        Ok(optime)
    }
}
