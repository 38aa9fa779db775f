//! Query router.
//!
//! A [`Router`] turns client operations into shard-targeted requests using
//! its [`CatalogCache`]. Every request carries the routing version the
//! router believed in; a shard that disagrees answers with a staleness
//! error, the router refreshes the affected cache entry and re-sends
//! whatever has not been acknowledged yet. The loop is bounded by
//! `max_stale_retries`.
//!
//! Writes are retryable by default: each command runs under a session
//! identity so a re-sent statement is recognised by the shard and not
//! applied twice.

pub mod catalog_cache;
pub mod targeting;
pub mod transaction;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use kestrel_common::authz::Principal;
use kestrel_common::config::RouterConfig;
use kestrel_common::error::ShardingError;
use kestrel_common::pipeline::{Pipeline, PipelineExecutor};
use kestrel_common::{
    ClusterClock, DocKey, Document, Filter, KestrelError, KestrelResult, Lsid, Namespace, ShardId,
    StmtId, TxnKey, TxnNumber, UpdateSpec, WriteConcern,
};

pub use catalog_cache::{CatalogCache, CatalogCacheSnapshot, Route};
pub use transaction::RouterTransaction;

use crate::change_stream::{ChangeStreamCursor, ChangeStreamOptions, WatchTarget};
use crate::messages::{SessionContext, ShardRequest, WriteOp, WriteResult, WriteStatement};
use crate::transport::{ClusterTransport, RpcClient};
use targeting::{is_single_target, targets_for_filter, targets_for_write};

/// How a write command is acknowledged and identified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Retryable-write identity. When absent and the router retries writes,
    /// a fresh one is generated for the command.
    pub session: Option<TxnKey>,
    pub write_concern: WriteConcern,
}

impl WriteOptions {
    pub fn retryable(key: TxnKey) -> Self {
        Self {
            session: Some(key),
            ..Self::default()
        }
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }
}

/// A logical client session. Hands out increasing transaction numbers for
/// retryable writes and transactions.
#[derive(Debug)]
pub struct ClientSession {
    lsid: Lsid,
    txn_number: AtomicI64,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            lsid: Lsid::generate(),
            txn_number: AtomicI64::new(0),
        }
    }

    pub fn lsid(&self) -> Lsid {
        self.lsid
    }

    pub fn next_txn(&self) -> TxnKey {
        let n = self.txn_number.fetch_add(1, Ordering::Relaxed) + 1;
        TxnKey::new(self.lsid, TxnNumber(n))
    }
}

#[derive(Debug, Default)]
struct RouterMetrics {
    ops: AtomicU64,
    failed_ops: AtomicU64,
    stale_retries: AtomicU64,
    network_retries: AtomicU64,
    txns_committed: AtomicU64,
    txns_aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub ops: u64,
    pub failed_ops: u64,
    pub stale_retries: u64,
    pub network_retries: u64,
    pub txns_committed: u64,
    pub txns_aborted: u64,
    pub cache: CatalogCacheSnapshot,
}

#[derive(Debug, Default)]
struct RetryState {
    stale: u32,
    network: u32,
}

pub struct Router {
    name: String,
    /// Client identity, for data operations.
    rpc: RpcClient,
    /// Internal identity, for catalog lookups and transaction control.
    internal: RpcClient,
    cache: CatalogCache,
    config: RouterConfig,
    executor: Arc<dyn PipelineExecutor>,
    retry_writes: bool,
    metrics: RouterMetrics,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("principal", self.rpc.principal())
            .field("retry_writes", &self.retry_writes)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Router {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
        clock: Arc<ClusterClock>,
        principal: Principal,
        config: RouterConfig,
        executor: Arc<dyn PipelineExecutor>,
    ) -> Self {
        let rpc = RpcClient::new(transport, clock, principal, config.request_timeout());
        let internal = rpc.as_principal(Principal::Internal);
        Self {
            name: name.into(),
            cache: CatalogCache::new(internal.clone()),
            rpc,
            internal,
            config,
            executor,
            retry_writes: true,
            metrics: RouterMetrics::default(),
        }
    }

    pub fn with_retry_writes(mut self, enabled: bool) -> Self {
        self.retry_writes = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<ClusterClock> {
        self.rpc.clock()
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub(crate) fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub(crate) fn internal_rpc(&self) -> &RpcClient {
        &self.internal
    }

    /// Drop every cached routing entry.
    pub fn flush_routing_cache(&self) {
        self.cache.clear();
    }

    /// Shards `filter` would be sent to for `ns`.
    pub fn route(&self, ns: &Namespace, filter: &Filter) -> KestrelResult<BTreeSet<ShardId>> {
        let route = self.cache.route(ns, false)?;
        Ok(targets_for_filter(&route, filter))
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            ops: self.metrics.ops.load(Ordering::Relaxed),
            failed_ops: self.metrics.failed_ops.load(Ordering::Relaxed),
            stale_retries: self.metrics.stale_retries.load(Ordering::Relaxed),
            network_retries: self.metrics.network_retries.load(Ordering::Relaxed),
            txns_committed: self.metrics.txns_committed.load(Ordering::Relaxed),
            txns_aborted: self.metrics.txns_aborted.load(Ordering::Relaxed),
            cache: self.cache.snapshot(),
        }
    }

    // ── Writes ──

    pub fn insert(&self, ns: &Namespace, docs: Vec<Document>) -> KestrelResult<WriteResult> {
        let ops = docs.into_iter().map(|doc| WriteOp::Insert { doc }).collect();
        self.write(ns, ops, WriteOptions::default())
    }

    pub fn update(
        &self,
        ns: &Namespace,
        filter: Filter,
        update: UpdateSpec,
        upsert: bool,
        multi: bool,
    ) -> KestrelResult<WriteResult> {
        let op = WriteOp::Update {
            filter,
            update,
            upsert,
            multi,
        };
        self.write(ns, vec![op], WriteOptions::default())
    }

    pub fn delete(
        &self,
        ns: &Namespace,
        filter: Filter,
        multi: bool,
    ) -> KestrelResult<WriteResult> {
        self.write(ns, vec![WriteOp::Delete { filter, multi }], WriteOptions::default())
    }

    /// Execute an ordered batch of write statements. Statement ids are the
    /// positions in `ops`.
    pub fn write(
        &self,
        ns: &Namespace,
        ops: Vec<WriteOp>,
        options: WriteOptions,
    ) -> KestrelResult<WriteResult> {
        let session = options.session.or_else(|| {
            self.retry_writes
                .then(|| TxnKey::new(Lsid::generate(), TxnNumber(1)))
        });
        let statements: Vec<WriteStatement> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| WriteStatement {
                stmt_id: i as StmtId,
                op,
            })
            .collect();
        let op_name = statements.first().map_or("write", |s| s.op.name());
        let mut touched = BTreeSet::new();
        let result = self.run_write(ns, &statements, session, options.write_concern, &mut touched);
        self.record_op(op_name, touched.len(), result.is_ok());
        result
    }

    fn run_write(
        &self,
        ns: &Namespace,
        statements: &[WriteStatement],
        session: Option<TxnKey>,
        write_concern: WriteConcern,
        touched: &mut BTreeSet<ShardId>,
    ) -> KestrelResult<WriteResult> {
        let session = session.map(|k| SessionContext {
            lsid: k.lsid,
            txn_number: k.txn_number,
            txn: None,
        });
        let mut result = WriteResult::default();
        let mut done = vec![false; statements.len()];
        let mut acked: Vec<BTreeSet<ShardId>> = vec![BTreeSet::new(); statements.len()];
        let mut retry = RetryState::default();
        loop {
            let route = self.cache.route(ns, true)?;
            let mut batches: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
            for (i, stmt) in statements.iter().enumerate() {
                if done[i] {
                    continue;
                }
                for shard in targets_for_write(&route, &stmt.op)? {
                    if !acked[i].contains(&shard) {
                        batches.entry(shard).or_default().push(i);
                    }
                }
            }
            if batches.is_empty() {
                return Ok(result);
            }

            let mut failure = None;
            for (shard, idxs) in batches {
                touched.insert(shard);
                let req = ShardRequest::Write {
                    ns: ns.clone(),
                    version: route.version_for(shard),
                    statements: idxs.iter().map(|&i| statements[i].clone()).collect(),
                    session,
                    write_concern,
                };
                match self.rpc.shard(shard, req).and_then(|r| r.into_written()) {
                    Ok(r) => {
                        result.merge(r);
                        for i in idxs {
                            acked[i].insert(shard);
                            if is_single_target(&statements[i].op) {
                                done[i] = true;
                            }
                        }
                    }
                    Err(e) => {
                        failure = Some((shard, e));
                        break;
                    }
                }
            }
            let Some((shard, err)) = failure else {
                return Ok(result);
            };
            tracing::debug!(
                router = %self.name,
                ns = %ns,
                shard = %shard,
                error = %err,
                "write attempt failed",
            );
            self.retry_or_fail(ns, err, &mut retry, session.is_some())?;
        }
    }

    // ── Reads ──

    /// Matching documents from every targeted shard, ordered by `_id`.
    pub fn find(&self, ns: &Namespace, filter: &Filter) -> KestrelResult<Vec<Document>> {
        let mut retry = RetryState::default();
        loop {
            let route = self.cache.route(ns, false)?;
            let targets = targets_for_filter(&route, filter);
            match self.find_on(ns, &route, &targets, filter) {
                Ok(mut docs) => {
                    docs.sort_by(|a, b| DocKey::of(a).ok().cmp(&DocKey::of(b).ok()));
                    self.record_op("find", targets.len(), true);
                    return Ok(docs);
                }
                Err(e) => {
                    if let Err(e) = self.retry_or_fail(ns, e, &mut retry, true) {
                        self.record_op("find", targets.len(), false);
                        return Err(e);
                    }
                }
            }
        }
    }

    fn find_on(
        &self,
        ns: &Namespace,
        route: &Route,
        targets: &BTreeSet<ShardId>,
        filter: &Filter,
    ) -> KestrelResult<Vec<Document>> {
        let mut docs = Vec::new();
        for &shard in targets {
            let req = ShardRequest::Find {
                ns: ns.clone(),
                version: route.version_for(shard),
                filter: filter.clone(),
                session: None,
            };
            docs.extend(self.rpc.shard(shard, req)?.into_docs()?);
        }
        Ok(docs)
    }

    pub fn find_one(&self, ns: &Namespace, filter: &Filter) -> KestrelResult<Option<Document>> {
        Ok(self.find(ns, filter)?.into_iter().next())
    }

    pub fn count(&self, ns: &Namespace, filter: &Filter) -> KestrelResult<u64> {
        Ok(self.find(ns, filter)?.len() as u64)
    }

    /// Gather the documents matching `filter` and hand them to the pipeline
    /// executor.
    pub fn aggregate(
        &self,
        ns: &Namespace,
        filter: &Filter,
        pipeline: &Pipeline,
    ) -> KestrelResult<Vec<Document>> {
        let docs = self.find(ns, filter)?;
        if pipeline.is_empty() {
            return Ok(docs);
        }
        self.executor.execute(pipeline, docs)
    }

    // ── Sessions, transactions and change streams ──

    pub fn start_transaction(&self, session: &ClientSession) -> RouterTransaction<'_> {
        RouterTransaction::begin(self, session.next_txn())
    }

    pub fn watch(
        &self,
        target: WatchTarget,
        options: ChangeStreamOptions,
    ) -> KestrelResult<ChangeStreamCursor> {
        ChangeStreamCursor::open(self.rpc.clone(), target, options, Arc::clone(&self.executor))
    }

    // ── Retry policy ──

    /// Decide whether a failed attempt is retried. Staleness refreshes the
    /// cache; network failures back off, but only for retryable operations.
    fn retry_or_fail(
        &self,
        ns: &Namespace,
        err: KestrelError,
        state: &mut RetryState,
        retryable: bool,
    ) -> KestrelResult<()> {
        if err.is_stale() {
            state.stale += 1;
            if state.stale > self.config.max_stale_retries {
                tracing::warn!(
                    router = %self.name,
                    ns = %ns,
                    attempts = state.stale,
                    error = %err,
                    "routing retries exhausted",
                );
                return Err(ShardingError::RoutingRetriesExhausted {
                    ns: ns.to_string(),
                    attempts: state.stale,
                    last: err.to_string(),
                }
                .into());
            }
            self.metrics.stale_retries.fetch_add(1, Ordering::Relaxed);
            kestrel_observability::record_routing_retry("stale");
            self.cache.on_stale(ns, &err);
            let wait = err.retry_after_ms();
            if wait > 0 {
                std::thread::sleep(Duration::from_millis(wait));
            }
            return Ok(());
        }
        if retryable && (err.is_network_like() || err.is_retryable()) {
            if state.network >= self.config.max_network_retries {
                return Err(err);
            }
            let delay = self
                .backoff(state.network)
                .max(Duration::from_millis(err.retry_after_ms()));
            state.network += 1;
            self.metrics.network_retries.fetch_add(1, Ordering::Relaxed);
            kestrel_observability::record_routing_retry("network");
            tracing::debug!(
                router = %self.name,
                ns = %ns,
                attempt = state.network,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after network error"
            );
            std::thread::sleep(delay);
            return Ok(());
        }
        Err(err)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_for_attempt(attempt);
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=ratio);
        base + base.mul_f64(jitter)
    }

    fn record_op(&self, op: &str, targets: usize, success: bool) {
        self.metrics.ops.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.metrics.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
        kestrel_observability::record_router_op(op, targets, success);
    }

    fn record_txn(&self, committed: bool) {
        if committed {
            self.metrics.txns_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.txns_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }
}
