//! Two-phase commit coordinator.
//!
//! The coordinator persists its participant list before asking anyone to
//! prepare and persists the decision before delivering it, both with
//! majority write concern on its own replica set. A coordinator that loses
//! its primary therefore resumes from one of three states: no document
//! (nothing to do), a document without a decision (abort), or a decision
//! (deliver it again).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::{KestrelResult, LogicalTimestamp, Namespace, ShardId, TxnKey, WriteConcern};
use kestrel_repl::ReplicaSet;

use super::CommitDecision;
use crate::durable;
use crate::fault_injection::{Failpoints, HANG_BEFORE_DELIVERING_DECISION};
use crate::messages::ShardRequest;
use crate::transport::RpcClient;

/// Attempts per participant before delivery is left to recovery.
const DELIVERY_ATTEMPTS: u32 = 5;
const DELIVERY_BACKOFF: Duration = Duration::from_millis(5);

pub fn coordinators_ns() -> Namespace {
    Namespace::new("config", "transaction_coordinators")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    pub key: TxnKey,
    pub participants: Vec<ShardId>,
    pub decision: Option<CommitDecision>,
    /// Every participant has applied the decision.
    pub acknowledged: bool,
}

#[derive(Debug, Default)]
struct CoordinatorMetrics {
    commits: AtomicU64,
    aborts: AtomicU64,
    recovered: AtomicU64,
    delivery_retries: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorSnapshot {
    pub commits: u64,
    pub aborts: u64,
    pub recovered: u64,
    pub delivery_retries: u64,
    pub inflight: usize,
    pub awaiting_gc: usize,
}

#[derive(Debug)]
pub struct TxnCoordinator {
    shard: ShardId,
    gc_delay: Duration,
    inflight: Mutex<HashSet<TxnKey>>,
    recovery_needed: AtomicBool,
    gc_queue: Mutex<Vec<(TxnKey, Instant)>>,
    metrics: CoordinatorMetrics,
}

impl TxnCoordinator {
    pub fn new(shard: ShardId, gc_delay: Duration) -> Self {
        Self {
            shard,
            gc_delay,
            inflight: Mutex::new(HashSet::new()),
            recovery_needed: AtomicBool::new(false),
            gc_queue: Mutex::new(Vec::new()),
            metrics: CoordinatorMetrics::default(),
        }
    }

    /// Called on step-up; the next [`TxnCoordinator::resume_pending`] scans
    /// the persisted documents.
    pub fn mark_recovery_needed(&self) {
        self.recovery_needed.store(true, Ordering::Release);
    }

    /// Run two-phase commit for `key` across `participants`. Asking again
    /// for a transaction that already has a decision returns that decision.
    pub fn coordinate(
        &self,
        rs: &ReplicaSet,
        rpc: &RpcClient,
        failpoints: &Failpoints,
        key: TxnKey,
        participants: Vec<ShardId>,
    ) -> KestrelResult<CommitDecision> {
        if !self.inflight.lock().insert(key) {
            return Err(kestrel_common::KestrelError::retryable(
                format!("commit of {key} already in progress"),
                10,
            ));
        }
        let result = self.coordinate_inner(rs, rpc, failpoints, key, participants);
        self.inflight.lock().remove(&key);
        result
    }

    fn coordinate_inner(
        &self,
        rs: &ReplicaSet,
        rpc: &RpcClient,
        failpoints: &Failpoints,
        key: TxnKey,
        participants: Vec<ShardId>,
    ) -> KestrelResult<CommitDecision> {
        let storage = rs.primary_storage()?;
        let existing: Option<CoordinatorDocument> =
            durable::get(&storage, &coordinators_ns(), &key.to_string())?;
        let (mut doc, fresh) = match existing {
            Some(doc) => {
                tracing::info!(
                    shard = %self.shard,
                    txn = %key,
                    decided = doc.decision.is_some(),
                    "coordinator document exists",
                );
                (doc, false)
            }
            None => {
                let doc = CoordinatorDocument {
                    key,
                    participants,
                    decision: None,
                    acknowledged: false,
                };
                self.persist(rs, &doc)?;
                (doc, true)
            }
        };

        if doc.decision.is_none() {
            // An undecided document left by an earlier attempt cannot be
            // committed: some participant may never have prepared.
            let decision = if fresh {
                self.prepare_all(rpc, key, &doc.participants)
            } else {
                CommitDecision::Abort
            };
            doc.decision = Some(decision);
            self.persist(rs, &doc)?;
            tracing::info!(
                shard = %self.shard,
                txn = %key,
                decision = decision.as_str(),
                participants = doc.participants.len(),
                "commit decision persisted"
            );
        }
        let Some(decision) = doc.decision else {
            return Err(kestrel_common::KestrelError::internal_bug(
                "E-TXN-001",
                "coordinator document lost its decision",
                key.to_string(),
            ));
        };

        failpoints.check(HANG_BEFORE_DELIVERING_DECISION, self.shard)?;
        self.deliver(rs, rpc, &mut doc)?;
        match decision {
            CommitDecision::Commit { .. } => self.metrics.commits.fetch_add(1, Ordering::Relaxed),
            CommitDecision::Abort => self.metrics.aborts.fetch_add(1, Ordering::Relaxed),
        };
        kestrel_observability::record_txn_decision(decision.as_str(), doc.participants.len());
        Ok(decision)
    }

    /// Ask every participant to prepare. Any failure decides abort; the
    /// commit timestamp is the latest prepare timestamp.
    fn prepare_all(
        &self,
        rpc: &RpcClient,
        key: TxnKey,
        participants: &[ShardId],
    ) -> CommitDecision {
        let mut commit_ts = LogicalTimestamp::MIN;
        for &p in participants {
            match rpc
                .shard(p, ShardRequest::PrepareTransaction { key })
                .and_then(|r| r.into_prepare_ts())
            {
                Ok(ts) => commit_ts = commit_ts.max(ts),
                Err(e) => {
                    tracing::info!(
                        shard = %self.shard,
                        txn = %key,
                        participant = %p,
                        error = %e,
                        "prepare failed, aborting",
                    );
                    return CommitDecision::Abort;
                }
            }
        }
        CommitDecision::Commit { commit_ts }
    }

    /// Deliver the decision to every participant, then retire the document.
    fn deliver(
        &self,
        rs: &ReplicaSet,
        rpc: &RpcClient,
        doc: &mut CoordinatorDocument,
    ) -> KestrelResult<()> {
        let Some(decision) = doc.decision else {
            return Ok(());
        };
        let key = doc.key;
        for &p in &doc.participants {
            let mut attempt = 0;
            loop {
                let req = match decision {
                    CommitDecision::Commit { commit_ts } => ShardRequest::CommitTransaction {
                        key,
                        commit_ts: Some(commit_ts),
                    },
                    CommitDecision::Abort => ShardRequest::AbortTransaction { key },
                };
                match rpc.shard(p, req).and_then(|r| r.into_ok()) {
                    Ok(()) => break,
                    Err(e) if e.is_network_like() || e.is_retryable() => {
                        attempt += 1;
                        if attempt >= DELIVERY_ATTEMPTS {
                            tracing::warn!(
                                shard = %self.shard,
                                txn = %key,
                                participant = %p,
                                error = %e,
                                "decision undelivered, left for recovery",
                            );
                            return Err(e);
                        }
                        self.metrics.delivery_retries.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(DELIVERY_BACKOFF * attempt);
                    }
                    Err(e) => {
                        // The participant already forgot the transaction.
                        tracing::debug!(
                            shard = %self.shard,
                            txn = %key,
                            participant = %p,
                            error = %e,
                            "decision not applicable",
                        );
                        break;
                    }
                }
            }
        }
        doc.acknowledged = true;
        if self.gc_delay.is_zero() {
            self.remove(rs, key)?;
        } else {
            self.persist(rs, doc)?;
            self.gc_queue.lock().push((key, Instant::now() + self.gc_delay));
        }
        tracing::debug!(
            shard = %self.shard,
            txn = %key,
            decision = decision.as_str(),
            "decision delivered",
        );
        Ok(())
    }

    /// Finish whatever a previous primary left behind and collect
    /// acknowledged documents. Returns decisions delivered.
    pub fn resume_pending(
        &self,
        rs: &ReplicaSet,
        rpc: &RpcClient,
        failpoints: &Failpoints,
    ) -> KestrelResult<usize> {
        let now = Instant::now();
        let due: Vec<TxnKey> = {
            let mut q = self.gc_queue.lock();
            let (due, later): (Vec<_>, Vec<_>) = q.drain(..).partition(|(_, at)| *at <= now);
            *q = later;
            due.into_iter().map(|(k, _)| k).collect()
        };
        for key in due {
            self.remove(rs, key)?;
        }

        let storage = rs.primary_storage()?;
        let docs: Vec<CoordinatorDocument> = durable::load(&storage, &coordinators_ns())?;
        let scan_all = self.recovery_needed.swap(false, Ordering::AcqRel);
        let mut delivered = 0;
        for mut doc in docs {
            let key = doc.key;
            if self.inflight.lock().contains(&key) {
                continue;
            }
            if doc.acknowledged {
                if scan_all {
                    self.remove(rs, key)?;
                }
                continue;
            }
            if doc.decision.is_none() {
                doc.decision = Some(CommitDecision::Abort);
                self.persist(rs, &doc)?;
            }
            let decision = doc.decision.map_or("abort", |d| d.as_str());
            if failpoints.check(HANG_BEFORE_DELIVERING_DECISION, self.shard).is_err() {
                continue;
            }
            match self.deliver(rs, rpc, &mut doc) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.recovered.fetch_add(1, Ordering::Relaxed);
                    kestrel_observability::record_txn_recovered(decision);
                    tracing::info!(
                        shard = %self.shard,
                        txn = %key,
                        decision,
                        "recovered commit decision delivered",
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        shard = %self.shard,
                        txn = %key,
                        error = %e,
                        "recovery delivery failed",
                    );
                }
            }
        }
        Ok(delivered)
    }

    fn persist(&self, rs: &ReplicaSet, doc: &CoordinatorDocument) -> KestrelResult<()> {
        rs.write_with_concern(WriteConcern::Majority, |w| {
            durable::log_put(w, &coordinators_ns(), &doc.key.to_string(), doc)
        })
    }

    fn remove(&self, rs: &ReplicaSet, key: TxnKey) -> KestrelResult<()> {
        rs.write_with_concern(WriteConcern::Majority, |w| {
            durable::log_delete(w, &coordinators_ns(), &key.to_string())
        })
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            commits: self.metrics.commits.load(Ordering::Relaxed),
            aborts: self.metrics.aborts.load(Ordering::Relaxed),
            recovered: self.metrics.recovered.load(Ordering::Relaxed),
            delivery_retries: self.metrics.delivery_retries.load(Ordering::Relaxed),
            inflight: self.inflight.lock().len(),
            awaiting_gc: self.gc_queue.lock().len(),
        }
    }
}
