//! Router side of a multi-statement transaction.
//!
//! Every statement reads at the snapshot taken when the transaction began.
//! The first shard a statement reaches becomes the coordinator; commit goes
//! straight to the only participant or through the coordinator's two-phase
//! commit when there are several.

use std::collections::BTreeSet;

use kestrel_common::error::TxnError;
use kestrel_common::{
    DocKey, Document, Filter, KestrelResult, LogicalTimestamp, Namespace, ShardId, StmtId,
    TxnKey, UpdateSpec, WriteConcern,
};

use super::targeting::{targets_for_filter, targets_for_write};
use super::{RetryState, Route, Router};
use crate::messages::{
    SessionContext, ShardRequest, TxnStatement, WriteOp, WriteResult, WriteStatement,
};
use crate::txn::CommitDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct RouterTransaction<'r> {
    router: &'r Router,
    key: TxnKey,
    read_ts: LogicalTimestamp,
    /// In the order they joined; the first is the coordinator.
    participants: Vec<ShardId>,
    next_stmt: StmtId,
    state: TxnState,
}

impl<'r> RouterTransaction<'r> {
    pub(super) fn begin(router: &'r Router, key: TxnKey) -> Self {
        let read_ts = router.clock().now();
        tracing::debug!(
            router = router.name(),
            txn = %key,
            read_ts = %read_ts,
            "transaction started",
        );
        Self {
            router,
            key,
            read_ts,
            participants: Vec::new(),
            next_stmt: 0,
            state: TxnState::Active,
        }
    }

    pub fn key(&self) -> TxnKey {
        self.key
    }

    pub fn read_ts(&self) -> LogicalTimestamp {
        self.read_ts
    }

    pub fn participants(&self) -> &[ShardId] {
        &self.participants
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn ensure_active(&self) -> KestrelResult<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(TxnError::AlreadyCommitted(self.key).into()),
            TxnState::Aborted => Err(TxnError::NoSuchTransaction(self.key).into()),
        }
    }

    fn session_for(&self, shard: ShardId) -> SessionContext {
        SessionContext {
            lsid: self.key.lsid,
            txn_number: self.key.txn_number,
            txn: Some(TxnStatement {
                read_ts: self.read_ts,
                start: !self.participants.contains(&shard),
            }),
        }
    }

    fn join(&mut self, shard: ShardId) {
        if !self.participants.contains(&shard) {
            self.participants.push(shard);
        }
    }

    // ── Statements ──

    pub fn insert(&mut self, ns: &Namespace, docs: Vec<Document>) -> KestrelResult<WriteResult> {
        let mut total = WriteResult::default();
        for doc in docs {
            total.merge(self.write(ns, WriteOp::Insert { doc })?);
        }
        Ok(total)
    }

    pub fn update(
        &mut self,
        ns: &Namespace,
        filter: Filter,
        update: UpdateSpec,
        upsert: bool,
        multi: bool,
    ) -> KestrelResult<WriteResult> {
        self.write(
            ns,
            WriteOp::Update {
                filter,
                update,
                upsert,
                multi,
            },
        )
    }

    pub fn delete(
        &mut self,
        ns: &Namespace,
        filter: Filter,
        multi: bool,
    ) -> KestrelResult<WriteResult> {
        self.write(ns, WriteOp::Delete { filter, multi })
    }

    pub fn write(&mut self, ns: &Namespace, op: WriteOp) -> KestrelResult<WriteResult> {
        self.ensure_active()?;
        let stmt = WriteStatement {
            stmt_id: self.next_stmt,
            op,
        };
        self.next_stmt += 1;
        let result = self.with_routing_retry(ns, true, |txn, route| {
            let mut total = WriteResult::default();
            for shard in targets_for_write(route, &stmt.op)? {
                let req = ShardRequest::Write {
                    ns: ns.clone(),
                    version: route.version_for(shard),
                    statements: vec![stmt.clone()],
                    session: Some(txn.session_for(shard)),
                    write_concern: WriteConcern::One,
                };
                let r = txn.router.rpc().shard(shard, req)?.into_written()?;
                txn.join(shard);
                total.merge(r);
            }
            Ok(total)
        });
        self.fail_on_error(result)
    }

    pub fn find(&mut self, ns: &Namespace, filter: &Filter) -> KestrelResult<Vec<Document>> {
        self.ensure_active()?;
        let result = self.with_routing_retry(ns, false, |txn, route| {
            let mut docs = Vec::new();
            for shard in targets_for_filter(route, filter) {
                let req = ShardRequest::Find {
                    ns: ns.clone(),
                    version: route.version_for(shard),
                    filter: filter.clone(),
                    session: Some(txn.session_for(shard)),
                };
                docs.extend(txn.router.rpc().shard(shard, req)?.into_docs()?);
                txn.join(shard);
            }
            Ok(docs)
        });
        let mut docs = self.fail_on_error(result)?;
        docs.sort_by(|a, b| DocKey::of(a).ok().cmp(&DocKey::of(b).ok()));
        Ok(docs)
    }

    /// Staleness is only recoverable before any shard has joined: after
    /// that the snapshot already spans shards the new routing may not.
    fn with_routing_retry<T>(
        &mut self,
        ns: &Namespace,
        create_db: bool,
        mut attempt: impl FnMut(&mut Self, &Route) -> KestrelResult<T>,
    ) -> KestrelResult<T> {
        let mut retry = RetryState::default();
        loop {
            let route = self.router.cache().route(ns, create_db)?;
            match attempt(self, &route) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_stale() && self.participants.is_empty() => {
                    self.router.retry_or_fail(ns, e, &mut retry, false)?;
                }
                Err(e) => {
                    if e.is_stale() {
                        self.router.cache().on_stale(ns, &e);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn fail_on_error<T>(&mut self, result: KestrelResult<T>) -> KestrelResult<T> {
        if let Err(e) = &result {
            tracing::debug!(txn = %self.key, error = %e, "transaction statement failed, aborting");
            self.abort_participants();
        }
        result
    }

    // ── Termination ──

    pub fn commit(mut self) -> KestrelResult<()> {
        self.ensure_active()?;
        let outcome = self.commit_inner();
        match &outcome {
            Ok(()) => {
                self.state = TxnState::Committed;
                self.router.record_txn(true);
            }
            Err(e) => {
                tracing::debug!(txn = %self.key, error = %e, "transaction commit failed");
                // An undelivered decision is left to the coordinator.
                self.state = TxnState::Aborted;
                self.router.record_txn(false);
            }
        }
        outcome
    }

    fn commit_inner(&mut self) -> KestrelResult<()> {
        let internal = self.router.internal_rpc();
        match self.participants.as_slice() {
            [] => Ok(()),
            [only] => {
                let only = *only;
                self.with_network_retry(|| {
                    internal
                        .shard(
                            only,
                            ShardRequest::CommitTransaction {
                                key: self.key,
                                commit_ts: None,
                            },
                        )?
                        .into_ok()
                })
            }
            [coordinator, ..] => {
                let coordinator = *coordinator;
                let participants = self.participants.clone();
                let decision = self.with_network_retry(|| {
                    internal
                        .shard(
                            coordinator,
                            ShardRequest::CoordinateCommit {
                                key: self.key,
                                participants: participants.clone(),
                            },
                        )?
                        .into_decision()
                })?;
                tracing::debug!(
                    txn = %self.key,
                    coordinator = %coordinator,
                    participants = participants.len(),
                    decision = decision.as_str(),
                    "distributed transaction decided"
                );
                match decision {
                    CommitDecision::Commit { .. } => Ok(()),
                    CommitDecision::Abort => Err(TxnError::AbortedByCoordinator(self.key).into()),
                }
            }
        }
    }

    /// Commit requests are idempotent on the participant and coordinator,
    /// so network failures are retried with the router's backoff.
    fn with_network_retry<T>(
        &self,
        mut call: impl FnMut() -> KestrelResult<T>,
    ) -> KestrelResult<T> {
        let config = self.router.config();
        let mut attempt = 0;
        loop {
            match call() {
                Ok(v) => return Ok(v),
                Err(e)
                    if (e.is_network_like() || e.is_retryable())
                        && attempt < config.max_network_retries =>
                {
                    let delay = self.router.backoff(attempt);
                    attempt += 1;
                    tracing::debug!(txn = %self.key, attempt, error = %e, "retrying commit");
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn abort(mut self) -> KestrelResult<()> {
        self.ensure_active()?;
        self.abort_participants();
        Ok(())
    }

    fn abort_participants(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        self.state = TxnState::Aborted;
        self.router.record_txn(false);
        let internal = self.router.internal_rpc();
        let participants: BTreeSet<ShardId> = self.participants.iter().copied().collect();
        for shard in participants {
            let req = ShardRequest::AbortTransaction { key: self.key };
            if let Err(e) = internal.shard(shard, req).and_then(|r| r.into_ok()) {
                // The participant expires it on its own.
                tracing::debug!(txn = %self.key, shard = %shard, error = %e, "abort not delivered");
            }
        }
    }
}

impl Drop for RouterTransaction<'_> {
    fn drop(&mut self) {
        self.abort_participants();
    }
}
