//! A shard's request handler.
//!
//! One `ShardServer` fronts one replica set. It checks every versioned
//! request against its cached filtering metadata, runs client writes under
//! the replica set's write lock, and hosts the shard's halves of the
//! transaction, migration and change-stream protocols.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use kestrel_common::authz::{Action, AuthzGate, Principal, Resource};
use kestrel_common::config::{KestrelConfig, MigrationConfig, TxnConfig};
use kestrel_common::document::doc_size;
use kestrel_common::error::{ShardingError, StorageError};
use kestrel_common::{
    CollectionUuid, DocKey, Document, Filter, KestrelError, KestrelResult, KeyRange,
    LogicalTimestamp, Namespace, OpTime, ShardId, ShardKey, WriteConcern,
};
use kestrel_repl::{CrudOp, OplogDraft, OplogOp, PrimaryWrite, ReplicaSet, TxnInfo};
use kestrel_storage::CollectionOptions;

use super::critical_section::{CriticalScope, CriticalSections, WriteTarget};
use super::crud::{plan_write, DocSource, LatestSource, WriteContext};
use super::metadata::{CollectionFilter, ShardMetadata};
use super::participant::{ParticipantSnapshot, TxnParticipant};
use super::range_deleter::{RangeDeleter, RangeDeleterSnapshot};
use super::sessions::{derived_outcome, SessionCatalog};
use crate::catalog::{DatabaseEntry, FcvState};
use crate::change_stream::{shard_reader, WatchTarget};
use crate::fault_injection::Failpoints;
use crate::messages::{
    CollectionDescription, CollectionStats, ConfigRequest, SessionContext, ShardRequest,
    ShardResponse, SplitVector, VersionCheck, WriteOp, WriteResult, WriteStatement,
};
use crate::migration::{donor, MigrationRecipient};
use crate::transport::{ClusterTransport, Envelope, Reply, RpcClient, ShardService};
use crate::txn::TxnCoordinator;

/// Documents removed per range-deletion write.
const RANGE_DELETION_BATCH: usize = 128;

#[derive(Debug, Default)]
struct ShardServerMetrics {
    requests: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    step_ups: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct ShardServerSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub stale: u64,
    pub step_ups: u64,
    pub sessions: usize,
    pub critical_sections: usize,
    pub participant: ParticipantSnapshot,
    pub range_deleter: RangeDeleterSnapshot,
}

/// Work done by one [`ShardServer::run_maintenance`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub decisions_delivered: usize,
    pub txns_expired: usize,
    pub orphans_deleted: u64,
    pub migrations_recovered: usize,
}

/// How far a client write statement got under the write lock.
enum Attempt {
    Done(WriteResult),
    /// Filtering metadata changed since the version check.
    Stale,
    Critical(WriteTarget),
    Locked(DocKey),
}

pub struct ShardServer {
    id: ShardId,
    rs: Arc<ReplicaSet>,
    migration_cfg: MigrationConfig,
    txn_cfg: TxnConfig,
    authz: Arc<dyn AuthzGate>,
    rpc: RpcClient,
    failpoints: Arc<Failpoints>,
    metadata: ShardMetadata,
    critical: CriticalSections,
    sessions: SessionCatalog,
    participant: TxnParticipant,
    coordinator: TxnCoordinator,
    range_deleter: RangeDeleter,
    recipient: MigrationRecipient,
    pub(crate) donor_lock: Mutex<()>,
    pub(crate) migration_recovery: AtomicBool,
    fcv: RwLock<FcvState>,
    seen_term: AtomicU64,
    step_up_lock: Mutex<()>,
    metrics: ShardServerMetrics,
}

impl std::fmt::Debug for ShardServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardServer")
            .field("id", &self.id)
            .field("set", &self.rs.name())
            .field("requests", &self.metrics.requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl ShardServer {
    pub fn new(
        id: ShardId,
        rs: Arc<ReplicaSet>,
        config: &KestrelConfig,
        transport: Arc<dyn ClusterTransport>,
        authz: Arc<dyn AuthzGate>,
        failpoints: Arc<Failpoints>,
    ) -> Arc<Self> {
        let rpc = RpcClient::new(
            transport,
            Arc::clone(rs.clock()),
            Principal::Internal,
            config.router.request_timeout(),
        );
        Arc::new(Self {
            id,
            rs,
            migration_cfg: config.migration.clone(),
            txn_cfg: config.txn.clone(),
            authz,
            rpc,
            failpoints,
            metadata: ShardMetadata::new(id),
            critical: CriticalSections::new(),
            sessions: SessionCatalog::new(),
            participant: TxnParticipant::new(id),
            coordinator: TxnCoordinator::new(id, config.txn.coordinator_gc_delay()),
            range_deleter: RangeDeleter::new(
                id,
                config.migration.orphan_cleanup_delay(),
                RANGE_DELETION_BATCH,
            ),
            recipient: MigrationRecipient::new(id),
            donor_lock: Mutex::new(()),
            migration_recovery: AtomicBool::new(false),
            fcv: RwLock::new(FcvState::default()),
            seen_term: AtomicU64::new(0),
            step_up_lock: Mutex::new(()),
            metrics: ShardServerMetrics::default(),
        })
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn replica_set(&self) -> &Arc<ReplicaSet> {
        &self.rs
    }

    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    pub fn critical_sections(&self) -> &CriticalSections {
        &self.critical
    }

    pub fn sessions(&self) -> &SessionCatalog {
        &self.sessions
    }

    pub fn participant(&self) -> &TxnParticipant {
        &self.participant
    }

    pub fn coordinator(&self) -> &TxnCoordinator {
        &self.coordinator
    }

    pub fn range_deleter(&self) -> &RangeDeleter {
        &self.range_deleter
    }

    pub fn recipient(&self) -> &MigrationRecipient {
        &self.recipient
    }

    pub fn fcv(&self) -> FcvState {
        self.fcv.read().clone()
    }

    pub(crate) fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub(crate) fn failpoints(&self) -> &Failpoints {
        &self.failpoints
    }

    pub(crate) fn migration_config(&self) -> &MigrationConfig {
        &self.migration_cfg
    }

    pub fn snapshot(&self) -> ShardServerSnapshot {
        ShardServerSnapshot {
            requests: self.metrics.requests.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            stale: self.metrics.stale.load(Ordering::Relaxed),
            step_ups: self.metrics.step_ups.load(Ordering::Relaxed),
            sessions: self.sessions.len(),
            critical_sections: self.critical.list().len(),
            participant: self.participant.snapshot(),
            range_deleter: self.range_deleter.snapshot(),
        }
    }

    // ── Filtering metadata ──

    /// Reload `ns` from the config server, incrementally when possible.
    pub(crate) fn refresh_collection(&self, ns: &Namespace) -> KestrelResult<CollectionFilter> {
        let since = match self.metadata.collection(ns) {
            Some(CollectionFilter::Sharded(r)) => Some(r.version()),
            _ => None,
        };
        let update = self
            .rpc
            .config(ConfigRequest::GetRouting { ns: ns.clone(), since })?
            .into_routing()?;
        match self.metadata.install_collection(ns, update) {
            Ok(f) => Ok(f),
            Err(e) if since.is_some() => {
                tracing::debug!(
                    shard = %self.id,
                    ns = %ns,
                    error = %e,
                    "incremental refresh rejected, reloading",
                );
                self.metadata.forget_collection(ns);
                let full = self
                    .rpc
                    .config(ConfigRequest::GetRouting { ns: ns.clone(), since: None })?
                    .into_routing()?;
                self.metadata.install_collection(ns, full)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn refresh_database(&self, db: &str) -> KestrelResult<Option<DatabaseEntry>> {
        let entry = self
            .rpc
            .config(ConfigRequest::GetDatabase { db: db.to_string(), create: false })?
            .into_database()?;
        self.metadata.install_database(db, entry.clone());
        Ok(entry)
    }

    /// Cached filter for `ns`, loading it on first use.
    pub(crate) fn filter_for(&self, ns: &Namespace) -> KestrelResult<CollectionFilter> {
        match self.metadata.collection(ns) {
            Some(f) => Ok(f),
            None => self.refresh_collection(ns),
        }
    }

    fn check_version(
        &self,
        ns: &Namespace,
        version: VersionCheck,
    ) -> KestrelResult<CollectionFilter> {
        let result = self.check_version_inner(ns, version);
        if matches!(&result, Err(e) if e.is_stale()) {
            self.metrics.stale.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn check_version_inner(
        &self,
        ns: &Namespace,
        version: VersionCheck,
    ) -> KestrelResult<CollectionFilter> {
        match version {
            VersionCheck::Unchecked => self.filter_for(ns),
            VersionCheck::Sharded(received) => {
                let current = match self.metadata.collection(ns) {
                    Some(f)
                        if f.shard_version(self.id).is_some_and(|known| {
                            known.same_epoch(&received) && !known.is_older_than(&received)
                        }) =>
                    {
                        f
                    }
                    _ => self.refresh_collection(ns)?,
                };
                let wanted = current.shard_version(self.id);
                if wanted != Some(received) {
                    return Err(ShardingError::StaleConfig {
                        ns: ns.to_string(),
                        shard: self.id,
                        received: Some(received),
                        wanted,
                    }
                    .into());
                }
                Ok(current)
            }
            VersionCheck::Unsharded(received) => {
                let db = match self.metadata.database(&ns.db) {
                    Some(d) if d.version == received => Some(d),
                    _ => self.refresh_database(&ns.db)?,
                };
                match db {
                    Some(d) if d.version == received && d.primary == self.id => {}
                    other => {
                        return Err(ShardingError::StaleDbVersion {
                            db: ns.db.clone(),
                            received: Some(received),
                            wanted: other.map(|d| d.version),
                        }
                        .into())
                    }
                }
                let filter = self.filter_for(ns)?;
                if let CollectionFilter::Sharded(r) = &filter {
                    return Err(ShardingError::StaleConfig {
                        ns: ns.to_string(),
                        shard: self.id,
                        received: None,
                        wanted: Some(r.chunks.shard_version(self.id)),
                    }
                    .into());
                }
                Ok(filter)
            }
        }
    }

    // ── Step-up and maintenance ──

    /// Rebuild in-memory state after this replica set elected a new primary.
    fn check_step_up(&self) -> KestrelResult<()> {
        let primary = self.rs.primary()?;
        let term = primary.term();
        if self.seen_term.load(Ordering::Acquire) == term {
            return Ok(());
        }
        let _guard = self.step_up_lock.lock();
        if self.seen_term.load(Ordering::Acquire) == term {
            return Ok(());
        }
        let sessions = self
            .sessions
            .rebuild(&primary.oplog().entries(), |ns, doc| self.metadata.shard_key_of(ns, doc));
        let prepared = self.participant.on_step_up(&primary);
        let deletions = self.range_deleter.recover(primary.storage())?;
        self.coordinator.mark_recovery_needed();
        self.migration_recovery.store(true, Ordering::Release);
        self.seen_term.store(term, Ordering::Release);
        self.metrics.step_ups.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            shard = %self.id,
            term,
            node = %primary.id(),
            sessions,
            prepared,
            deletions,
            "shard state rebuilt for new primary"
        );
        Ok(())
    }

    /// Periodic background work: transaction recovery and expiry, migration
    /// recovery and orphan cleanup.
    pub fn run_maintenance(&self) -> KestrelResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if self.rs.primary().is_err() {
            return Ok(report);
        }
        self.check_step_up()?;
        report.decisions_delivered =
            self.coordinator
                .resume_pending(&self.rs, &self.rpc, &self.failpoints)?;
        report.txns_expired = self
            .participant
            .expire_idle(self.txn_cfg.transaction_lifetime());
        if self.migration_recovery.swap(false, Ordering::AcqRel) {
            match donor::recover(self) {
                Ok(n) => report.migrations_recovered = n,
                Err(e) => {
                    self.migration_recovery.store(true, Ordering::Release);
                    tracing::warn!(
                        shard = %self.id,
                        error = %e,
                        "migration recovery failed, will retry",
                    );
                }
            }
        }
        for ns in self.range_deleter.due_namespaces() {
            if self.metadata.collection(&ns).is_none() {
                if let Err(e) = self.refresh_collection(&ns) {
                    tracing::warn!(
                        shard = %self.id,
                        ns = %ns,
                        error = %e,
                        "cannot load metadata for range deletion",
                    );
                }
            }
        }
        report.orphans_deleted = self.range_deleter.run_due(&self.rs, &self.metadata)?;
        Ok(report)
    }

    // ── Client writes ──

    fn write(
        &self,
        ns: &Namespace,
        version: VersionCheck,
        statements: &[WriteStatement],
        session: Option<SessionContext>,
        write_concern: WriteConcern,
        deadline: Instant,
    ) -> KestrelResult<WriteResult> {
        if let Some(s) = session.filter(|s| s.txn.is_some()) {
            return self.txn_write(ns, version, statements, s, deadline);
        }
        let mut result = WriteResult::default();
        let mut last: Option<OpTime> = None;
        for stmt in statements {
            let (r, optime) = self.write_statement(ns, version, stmt, session.as_ref(), deadline)?;
            result.merge(r);
            last = last.max(optime);
        }
        if let Some(optime) = last {
            self.rs.wait_for(optime, write_concern)?;
        }
        Ok(result)
    }

    fn write_statement(
        &self,
        ns: &Namespace,
        version: VersionCheck,
        stmt: &WriteStatement,
        session: Option<&SessionContext>,
        deadline: Instant,
    ) -> KestrelResult<(WriteResult, Option<OpTime>)> {
        loop {
            let filter = self.check_version(ns, version)?;
            let out = self
                .rs
                .write(|w| self.apply_statement(w, ns, &filter, stmt, session))?;
            match out.value {
                Attempt::Done(r) => return Ok((r, out.last_optime)),
                Attempt::Stale => {
                    tracing::debug!(
                        shard = %self.id,
                        ns = %ns,
                        "filtering metadata changed before write, rechecking",
                    );
                }
                Attempt::Critical(target) => {
                    let until =
                        deadline.min(
                            Instant::now() + self.migration_cfg.critical_section_timeout(),
                        );
                    self.critical.wait_clear(ns, &target, false, until)?;
                }
                Attempt::Locked(id) => {
                    let until = deadline.min(Instant::now() + self.txn_cfg.lock_wait_timeout());
                    self.participant.wait_unlocked(ns, &id, until)?;
                }
            }
        }
    }

    fn apply_statement(
        &self,
        w: &mut PrimaryWrite<'_>,
        ns: &Namespace,
        filter: &CollectionFilter,
        stmt: &WriteStatement,
        session: Option<&SessionContext>,
    ) -> KestrelResult<Attempt> {
        if !self.metadata.is_current(ns, filter) {
            return Ok(Attempt::Stale);
        }
        if let Some(s) = session {
            self.sessions.begin(s.lsid, s.txn_number)?;
            if let Some(done) = self.sessions.executed(s.lsid, s.txn_number, stmt.stmt_id)? {
                tracing::debug!(
                    shard = %self.id,
                    ns = %ns,
                    lsid = %s.lsid,
                    stmt = stmt.stmt_id,
                    "retryable statement replayed",
                );
                return Ok(Attempt::Done(WriteResult {
                    n: done.n,
                    n_modified: done.n_modified,
                    upserted: Vec::new(),
                }));
            }
        }
        let target = write_target(filter, &stmt.op);
        if self.critical.blocking_write(ns, &target).is_some() {
            return Ok(Attempt::Critical(target));
        }
        let ctx = WriteContext { ns, shard: self.id, filter };
        let plan = plan_write(&ctx, &stmt.op, &LatestSource(w.storage()))?;
        for op in &plan.ops {
            let id = op.doc_key()?;
            if self.participant.lock_holder(ns, &id).is_some() {
                return Ok(Attempt::Locked(id));
            }
        }

        let mut keys = Vec::new();
        if session.is_some() {
            for op in &plan.ops {
                let doc = match op.post_image() {
                    Some(d) => Some(d.clone()),
                    None => w.storage().get_latest(ns, &op.doc_key()?),
                };
                if let Some(k) = doc.as_ref().and_then(|d| filter.shard_key_of(d)) {
                    keys.push(k);
                }
            }
        }
        let derived = derived_outcome(&plan.ops);
        let nothing_logged = plan.ops.is_empty();
        let uuid = match (nothing_logged, w.storage().collection_info(ns)) {
            (_, Some(info)) => Some(info.uuid),
            (true, None) => None,
            (false, None) => Some(create_implicitly(w, ns, filter)?),
        };
        let info = session.map(|s| TxnInfo {
            lsid: s.lsid,
            txn_number: s.txn_number,
            stmt_ids: vec![stmt.stmt_id],
        });
        for op in plan.ops {
            let mut draft = OplogDraft::new(ns.clone(), uuid, OplogOp::Crud(op));
            if let Some(info) = &info {
                draft = draft.with_txn(info.clone());
            }
            w.log(draft)?;
        }
        if let (Some(s), Some(info)) = (session, info) {
            if nothing_logged || plan.outcome != derived {
                w.log(
                    OplogDraft::new(
                        ns.clone(),
                        uuid,
                        OplogOp::SessionOutcomes {
                            outcomes: vec![(stmt.stmt_id, plan.outcome)],
                        },
                    )
                    .with_txn(info),
                )?;
            }
            self.sessions
                .record(s.lsid, s.txn_number, stmt.stmt_id, plan.outcome, ns, keys);
        }
        Ok(Attempt::Done(WriteResult {
            n: plan.outcome.n,
            n_modified: plan.outcome.n_modified,
            upserted: plan.upserted.into_iter().collect(),
        }))
    }

    fn txn_write(
        &self,
        ns: &Namespace,
        version: VersionCheck,
        statements: &[WriteStatement],
        session: SessionContext,
        deadline: Instant,
    ) -> KestrelResult<WriteResult> {
        let key = session.key();
        let Some(stmt_info) = session.txn else {
            return Err(KestrelError::internal_bug(
                "E-SHARD-001",
                "transaction write without transaction info",
                key.to_string(),
            ));
        };
        let filter = self.check_version(ns, version)?;
        self.participant.begin(key, stmt_info)?;
        let storage = self.rs.primary_storage()?;
        let mut result = WriteResult::default();
        for stmt in statements {
            let target = write_target(&filter, &stmt.op);
            if self.critical.blocking_write(ns, &target).is_some() {
                // The migration will bump this shard's version; a transaction
                // cannot wait it out and must be retried from the start.
                self.participant.abort(key, &self.rs)?;
                return Err(ShardingError::StaleConfig {
                    ns: ns.to_string(),
                    shard: self.id,
                    received: None,
                    wanted: filter.shard_version(self.id),
                }
                .into());
            }
            let creates = match &stmt.op {
                WriteOp::Insert { .. } => true,
                WriteOp::Update { upsert, .. } => *upsert,
                WriteOp::Delete { .. } => false,
            };
            let uuid = match storage.collection_info(ns) {
                Some(info) => info.uuid,
                None if creates => self
                    .rs
                    .write(|w| create_implicitly(w, ns, &filter))?
                    .value,
                None => continue,
            };
            let ctx = WriteContext { ns, shard: self.id, filter: &filter };
            let r = self.participant.with_active(key, |work| {
                let plan = plan_write(&ctx, &stmt.op, &work.source(&storage))?;
                let r = WriteResult {
                    n: plan.outcome.n,
                    n_modified: plan.outcome.n_modified,
                    upserted: plan.upserted.into_iter().collect(),
                };
                for op in plan.ops {
                    work.stage(&storage, ns, uuid, op)?;
                }
                work.add_statement(stmt.stmt_id);
                Ok(r)
            })?;
            result.merge(r);
            if Instant::now() > deadline {
                return Err(KestrelError::ExceededTimeLimit(format!(
                    "transaction statement on {ns}"
                )));
            }
        }
        Ok(result)
    }

    // ── Client reads ──

    fn find(
        &self,
        ns: &Namespace,
        version: VersionCheck,
        query: &Filter,
        session: Option<SessionContext>,
        deadline: Instant,
    ) -> KestrelResult<Vec<Document>> {
        loop {
            let coll = self.check_version_for_read(ns, version, query, deadline)?;
            let docs = self.read_owned(ns, &coll, query, session, deadline)?;
            // A migration that committed during the scan leaves the result
            // filtered by ownership this shard no longer has.
            if self.metadata.is_current(ns, &coll) {
                return Ok(docs);
            }
            tracing::debug!(
                shard = %self.id,
                ns = %ns,
                "filtering metadata changed during read, rechecking",
            );
        }
    }

    fn check_version_for_read(
        &self,
        ns: &Namespace,
        version: VersionCheck,
        query: &Filter,
        deadline: Instant,
    ) -> KestrelResult<CollectionFilter> {
        loop {
            let coll = self.check_version(ns, version)?;
            let target = match coll.routing() {
                Some(r) => WriteTarget::Bounds(query.key_bounds(&r.entry.key_pattern)),
                None => WriteTarget::Any,
            };
            if self.critical.blocking_read(ns, &target).is_none() {
                return Ok(coll);
            }
            let until = deadline.min(
                Instant::now() + self.migration_cfg.critical_section_timeout(),
            );
            self.critical.wait_clear(ns, &target, true, until)?;
        }
    }

    fn read_owned(
        &self,
        ns: &Namespace,
        coll: &CollectionFilter,
        query: &Filter,
        session: Option<SessionContext>,
        deadline: Instant,
    ) -> KestrelResult<Vec<Document>> {
        let storage = self.rs.primary_storage()?;
        let shard = self.id;
        let pred = |d: &Document| query.matches(d) && coll.owns_doc(shard, d);
        let prepare_deadline =
            deadline.min(Instant::now() + self.txn_cfg.prepare_conflict_timeout());
        match session.and_then(|s| s.txn.map(|t| (s.key(), t))) {
            Some((key, txn)) => {
                self.participant.begin(key, txn)?;
                self.participant
                    .wait_prepared(ns, txn.read_ts, &pred, &storage, prepare_deadline)?;
                self.participant
                    .with_active(key, |work| work.source(&storage).find(ns, &pred))
            }
            None => {
                self.participant.wait_prepared(
                    ns,
                    LogicalTimestamp::MAX,
                    &pred,
                    &storage,
                    prepare_deadline,
                )?;
                Ok(storage.scan_latest_where(ns, pred))
            }
        }
    }

    // ── DDL and metadata ──

    fn enter_critical_section(
        &self,
        scope: CriticalScope,
        reason: &str,
        block_reads: bool,
    ) -> KestrelResult<()> {
        if !self.critical.is_active(&scope) {
            self.critical.enter(scope.clone(), reason)?;
        }
        if block_reads {
            self.critical.block_reads(&scope);
        }
        if let CriticalScope::Collection(ns) = &scope {
            self.participant.abort_active_on(ns);
        }
        // Writes that passed the section check before it existed finish
        // under the write lock; taking it once waits them out.
        self.rs.write(|_| Ok(()))?;
        Ok(())
    }

    fn exit_critical_section(&self, scope: &CriticalScope) {
        self.critical.exit(scope);
        match scope {
            CriticalScope::Range { ns, .. } | CriticalScope::Collection(ns) => {
                self.metadata.forget_collection(ns)
            }
            CriticalScope::Database(db) => self.metadata.forget_database(db),
        }
    }

    fn create_collection(
        &self,
        ns: &Namespace,
        uuid: Option<CollectionUuid>,
        options: CollectionOptions,
        from_migrate: bool,
    ) -> KestrelResult<()> {
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            if let Some(info) = w.storage().collection_info(ns) {
                return match uuid {
                    Some(u) if u != info.uuid => {
                        Err(StorageError::CollectionExists(ns.to_string()).into())
                    }
                    _ => Ok(()),
                };
            }
            let mut draft = OplogDraft::new(
                ns.clone(),
                Some(uuid.unwrap_or_else(CollectionUuid::generate)),
                OplogOp::Create { options },
            );
            if from_migrate {
                draft = draft.from_migrate();
            }
            w.log(draft)?;
            Ok(())
        })
    }

    fn coll_mod(&self, ns: &Namespace, options: CollectionOptions) -> KestrelResult<()> {
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            let Some(info) = w.storage().collection_info(ns) else {
                return Ok(());
            };
            w.log(OplogDraft::new(
                ns.clone(),
                Some(info.uuid),
                OplogOp::CollMod { options },
            ))?;
            Ok(())
        })
    }

    fn drop_collection(&self, ns: &Namespace, from_migrate: bool) -> KestrelResult<()> {
        self.participant.abort_active_on(ns);
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            let Some(info) = w.storage().collection_info(ns) else {
                return Ok(());
            };
            let mut draft = OplogDraft::new(ns.clone(), Some(info.uuid), OplogOp::Drop);
            if from_migrate {
                draft = draft.from_migrate();
            }
            w.log(draft)?;
            Ok(())
        })?;
        self.range_deleter.cancel_for(&self.rs, ns)?;
        self.metadata.forget_collection(ns);
        tracing::info!(shard = %self.id, ns = %ns, from_migrate, "collection dropped");
        Ok(())
    }

    fn drop_database(&self, db: &str, from_migrate: bool) -> KestrelResult<()> {
        let storage = self.rs.primary_storage()?;
        let colls: Vec<Namespace> = storage
            .list_collections()
            .into_iter()
            .map(|i| i.ns)
            .filter(|ns| ns.db == db)
            .collect();
        for ns in &colls {
            self.drop_collection(ns, from_migrate)?;
        }
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            let mut draft = OplogDraft::new(
                Namespace::database_command(db),
                None,
                OplogOp::DropDatabase,
            );
            if from_migrate {
                draft = draft.from_migrate();
            }
            w.log(draft)?;
            Ok(())
        })?;
        self.metadata.forget_database(db);
        tracing::info!(
            shard = %self.id,
            db,
            collections = colls.len(),
            from_migrate,
            "database dropped",
        );
        Ok(())
    }

    fn list_collections(&self, db: Option<&str>) -> KestrelResult<Vec<CollectionDescription>> {
        let storage = self.rs.primary_storage()?;
        Ok(storage
            .list_collections()
            .into_iter()
            .filter(|i| !i.ns.is_internal() && db.map_or(true, |d| i.ns.db == d))
            .map(|i| CollectionDescription {
                ns: i.ns,
                uuid: i.uuid,
                options: i.options,
            })
            .collect())
    }

    fn owned_docs(&self, ns: &Namespace) -> KestrelResult<Vec<Document>> {
        let filter = self.filter_for(ns)?;
        let storage = self.rs.primary_storage()?;
        Ok(storage.scan_latest_where(ns, |d| filter.owns_doc(self.id, d)))
    }

    fn install_collection(
        &self,
        collection: CollectionDescription,
        docs: Vec<Document>,
    ) -> KestrelResult<()> {
        let n = docs.len();
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            let ns = &collection.ns;
            match w.storage().collection_info(ns) {
                Some(info) if info.uuid != collection.uuid => {
                    return Err(StorageError::CollectionExists(ns.to_string()).into())
                }
                Some(_) => {}
                None => {
                    w.log(
                        OplogDraft::new(
                            ns.clone(),
                            Some(collection.uuid),
                            OplogOp::Create { options: collection.options },
                        )
                        .from_migrate(),
                    )?;
                }
            }
            for doc in docs {
                let op = upsert_op(w, ns, doc)?;
                w.log(
                    OplogDraft::new(
                        ns.clone(),
                        Some(collection.uuid),
                        OplogOp::Crud(op),
                    ).from_migrate(),
                )?;
            }
            Ok(())
        })?;
        self.metadata.forget_collection(&collection.ns);
        tracing::info!(shard = %self.id, ns = %collection.ns, docs = n, "collection installed");
        Ok(())
    }

    fn reshard_install(
        &self,
        ns: &Namespace,
        new_uuid: CollectionUuid,
        key_pattern: kestrel_common::ShardKeyPattern,
        docs: Vec<Document>,
        announce: bool,
    ) -> KestrelResult<()> {
        self.fcv.read().check_resharding_allowed()?;
        self.participant.abort_active_on(ns);
        let n = docs.len();
        self.rs.write_with_concern(WriteConcern::Majority, |w| {
            let old = w.storage().collection_info(ns);
            if old.as_ref().is_some_and(|i| i.uuid == new_uuid) {
                return Ok(());
            }
            let old_uuid = old.as_ref().map(|i| i.uuid);
            let options = old.as_ref().map(|i| i.options).unwrap_or_default();
            if announce {
                w.log(OplogDraft::new(
                    ns.clone(),
                    old_uuid,
                    OplogOp::ReshardCollection {
                        new_uuid,
                        key_pattern: key_pattern.clone(),
                    },
                ))?;
            }
            if old.is_some() {
                w.log(OplogDraft::new(ns.clone(), old_uuid, OplogOp::Drop).from_migrate())?;
            }
            w.log(
                OplogDraft::new(ns.clone(), Some(new_uuid), OplogOp::Create { options })
                    .from_migrate(),
            )?;
            for doc in docs {
                w.log(
                    OplogDraft::new(
                        ns.clone(),
                        Some(new_uuid),
                        OplogOp::Crud(CrudOp::Insert { doc }),
                    )
                        .from_migrate(),
                )?;
            }
            Ok(())
        })?;
        self.range_deleter.cancel_for(&self.rs, ns)?;
        self.metadata.forget_collection(ns);
        tracing::info!(
            shard = %self.id,
            ns = %ns,
            uuid = %new_uuid,
            docs = n,
            "resharded incarnation installed",
        );
        Ok(())
    }

    fn collection_stats(&self, ns: &Namespace) -> KestrelResult<CollectionStats> {
        let filter = self.filter_for(ns)?;
        let storage = self.rs.primary_storage()?;
        let mut stats = CollectionStats::default();
        for doc in storage.scan_latest_where(ns, |_| true) {
            if filter.owns_doc(self.id, &doc) {
                stats.docs += 1;
                stats.bytes += doc_size(&doc) as u64;
            } else {
                stats.orphans += 1;
            }
        }
        Ok(stats)
    }

    fn split_vector(
        &self,
        ns: &Namespace,
        range: &KeyRange,
        max_bytes: u64,
    ) -> KestrelResult<SplitVector> {
        let filter = self.filter_for(ns)?;
        let Some(routing) = filter.routing() else {
            return Err(ShardingError::NotSharded(ns.to_string()).into());
        };
        let pattern = &routing.entry.key_pattern;
        let storage = self.rs.primary_storage()?;
        let mut keyed: Vec<(ShardKey, u64)> = storage
            .scan_latest_where(ns, |_| true)
            .iter()
            .filter_map(|d| {
                let key = pattern.extract(d)?;
                (range.contains(&key) && filter.owns_key(self.id, &key))
                    .then(|| (key, doc_size(d) as u64))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let range_bytes: u64 = keyed.iter().map(|(_, s)| s).sum();
        let mut points: Vec<ShardKey> = Vec::new();
        if range_bytes > max_bytes {
            let mut acc = 0;
            for pair in keyed.windows(2) {
                acc += pair[0].1;
                let next = &pair[1].0;
                if acc >= max_bytes
                    && *next != pair[0].0
                    && *next > range.min
                    && points.last() != Some(next)
                {
                    points.push(next.clone());
                    acc = 0;
                }
            }
        }
        Ok(SplitVector { points, range_bytes })
    }

    // ── Dispatch ──

    fn authorize(&self, principal: &Principal, req: &ShardRequest) -> KestrelResult<()> {
        let collection = |ns: &Namespace| Resource::Collection {
            db: ns.db.clone(),
            coll: ns.coll.clone(),
        };
        match req {
            ShardRequest::Write { ns, statements, .. } => {
                for stmt in statements {
                    let action = match stmt.op {
                        WriteOp::Insert { .. } => Action::Insert,
                        WriteOp::Update { .. } => Action::Update,
                        WriteOp::Delete { .. } => Action::Remove,
                    };
                    self.authz.check(principal, action, &collection(ns))?;
                }
                Ok(())
            }
            ShardRequest::Find { ns, .. } => self.authz.check(
                principal,
                Action::Find,
                &collection(ns),
            ),
            ShardRequest::ChangeStreamFetch(req) => {
                let resource = match &req.target {
                    WatchTarget::Collection(ns) => collection(ns),
                    WatchTarget::Database(db) => Resource::Database(db.clone()),
                    WatchTarget::Cluster => Resource::Cluster,
                };
                self.authz.check(principal, Action::ChangeStream, &resource)
            }
            _ => self.authz.check(principal, Action::Internal, &Resource::Cluster),
        }
    }

    fn dispatch(
        &self,
        principal: &Principal,
        deadline: Instant,
        req: ShardRequest,
    ) -> KestrelResult<ShardResponse> {
        if let Err(e) = self.authorize(principal, &req) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.check_step_up()?;
        Ok(match req {
            ShardRequest::Write {
                ns,
                version,
                statements,
                session,
                write_concern,
            } => ShardResponse::Written(self.write(
                &ns,
                version,
                &statements,
                session,
                write_concern,
                deadline,
            )?),
            ShardRequest::Find {
                ns,
                version,
                filter,
                session,
            } => ShardResponse::Docs(self.find(&ns, version, &filter, session, deadline)?),
            ShardRequest::PrepareTransaction { key } => ShardResponse::Prepared {
                prepare_ts: self.participant.prepare(key, &self.rs)?,
            },
            ShardRequest::CommitTransaction { key, commit_ts } => {
                self.participant.commit(key, commit_ts, &self.rs)?;
                ShardResponse::Ok
            }
            ShardRequest::AbortTransaction { key } => {
                self.participant.abort(key, &self.rs)?;
                ShardResponse::Ok
            }
            ShardRequest::CoordinateCommit { key, participants } => {
                ShardResponse::Decision(self.coordinator.coordinate(
                    &self.rs,
                    &self.rpc,
                    &self.failpoints,
                    key,
                    participants,
                )?)
            }
            ShardRequest::ChangeStreamFetch(req) => {
                ShardResponse::Changes(shard_reader::read_changes(&self.rs, self.id, &req)?)
            }
            ShardRequest::ListCollections { db } => {
                ShardResponse::Collections(self.list_collections(db.as_deref())?)
            }
            ShardRequest::MoveRange {
                ns,
                range,
                to,
                epoch,
            } => ShardResponse::Migrated(donor::move_range(self, &ns, &range, to, epoch)?),
            ShardRequest::RecvChunkStart(start) => {
                self.recipient.start(self, start)?;
                ShardResponse::Ok
            }
            ShardRequest::RecvChunkBatch {
                migration_id,
                upserts,
                deletes,
            } => {
                self.recipient.apply_batch(self, &migration_id, upserts, deletes)?;
                ShardResponse::Ok
            }
            ShardRequest::RecvChunkCommit {
                migration_id,
                sessions,
            } => {
                self.recipient.commit(self, &migration_id, sessions)?;
                ShardResponse::Ok
            }
            ShardRequest::RecvChunkAbort { migration_id } => {
                self.recipient.abort(self, &migration_id)?;
                ShardResponse::Ok
            }
            ShardRequest::RefreshCollection { ns } => {
                self.metadata.forget_collection(&ns);
                self.refresh_collection(&ns)?;
                ShardResponse::Ok
            }
            ShardRequest::RefreshDatabase { db } => {
                self.metadata.forget_database(&db);
                self.refresh_database(&db)?;
                ShardResponse::Ok
            }
            ShardRequest::EnterCriticalSection {
                scope,
                reason,
                block_reads,
            } => {
                self.enter_critical_section(scope, &reason, block_reads)?;
                ShardResponse::Ok
            }
            ShardRequest::ExitCriticalSection { scope } => {
                self.exit_critical_section(&scope);
                ShardResponse::Ok
            }
            ShardRequest::SetFcv { state } => {
                tracing::info!(shard = %self.id, fcv = ?state, "feature compatibility version set");
                *self.fcv.write() = state;
                ShardResponse::Ok
            }
            ShardRequest::CreateCollection {
                ns,
                uuid,
                options,
                from_migrate,
            } => {
                self.create_collection(&ns, uuid, options, from_migrate)?;
                ShardResponse::Ok
            }
            ShardRequest::CollMod { ns, options } => {
                self.coll_mod(&ns, options)?;
                ShardResponse::Ok
            }
            ShardRequest::DropCollection { ns, from_migrate } => {
                self.drop_collection(&ns, from_migrate)?;
                ShardResponse::Ok
            }
            ShardRequest::DropDatabase { db, from_migrate } => {
                self.drop_database(&db, from_migrate)?;
                ShardResponse::Ok
            }
            ShardRequest::DumpCollection { ns } => ShardResponse::Docs(self.owned_docs(&ns)?),
            ShardRequest::InstallCollection { collection, docs } => {
                self.install_collection(collection, docs)?;
                ShardResponse::Ok
            }
            ShardRequest::ReshardInstall {
                ns,
                new_uuid,
                key_pattern,
                docs,
                announce,
            } => {
                self.reshard_install(&ns, new_uuid, key_pattern, docs, announce)?;
                ShardResponse::Ok
            }
            ShardRequest::CollectionStats { ns } => {
                ShardResponse::Stats(self.collection_stats(&ns)?)
            }
            ShardRequest::SplitVector {
                ns,
                range,
                max_bytes,
            } => ShardResponse::SplitPoints(self.split_vector(&ns, &range, max_bytes)?),
        })
    }
}

impl ShardService for ShardServer {
    fn handle(&self, req: Envelope<ShardRequest>) -> Reply<ShardResponse> {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let clock = self.rs.clock();
        clock.advance(req.cluster_time);
        let kind = req.body.kind();
        let body = self.dispatch(&req.principal, req.deadline, req.body);
        if let Err(e) = &body {
            if e.is_stale() {
                tracing::debug!(
                    shard = %self.id,
                    request = kind,
                    error = %e,
                    "stale request rejected",
                );
            } else {
                tracing::debug!(
                    shard = %self.id,
                    request = kind,
                    error = %e,
                    "shard request failed",
                );
            }
        }
        Reply::new(clock, body)
    }
}

/// Part of the collection `op` may touch, for critical-section checks.
fn write_target(filter: &CollectionFilter, op: &WriteOp) -> WriteTarget {
    let Some(routing) = filter.routing() else {
        return WriteTarget::Any;
    };
    let pattern = &routing.entry.key_pattern;
    match op {
        WriteOp::Insert { doc } => pattern.extract(doc).map_or(WriteTarget::Any, WriteTarget::Key),
        WriteOp::Update { filter, .. } | WriteOp::Delete { filter, .. } => {
            WriteTarget::Bounds(filter.key_bounds(pattern))
        }
    }
}

/// Create `ns` for a first write. Sharded collections keep their catalog uuid.
fn create_implicitly(
    w: &mut PrimaryWrite<'_>,
    ns: &Namespace,
    filter: &CollectionFilter,
) -> KestrelResult<CollectionUuid> {
    let uuid = filter
        .routing()
        .map_or_else(CollectionUuid::generate, |r| r.entry.uuid);
    w.log(OplogDraft::new(
        ns.clone(),
        Some(uuid),
        OplogOp::Create {
            options: CollectionOptions::default(),
        },
    ))?;
    tracing::debug!(ns = %ns, uuid = %uuid, "collection created implicitly");
    Ok(uuid)
}

/// Insert `doc`, or replace the stored version with the same `_id`.
pub(crate) fn upsert_op(
    w: &PrimaryWrite<'_>,
    ns: &Namespace,
    doc: Document,
) -> KestrelResult<CrudOp> {
    let doc_key = DocKey::of(&doc)?;
    Ok(if w.storage().get_latest(ns, &doc_key).is_some() {
        CrudOp::Update {
            doc_key,
            post_image: doc,
            updated_fields: Document::new(),
            removed_fields: Vec::new(),
            is_replacement: true,
        }
    } else {
        CrudOp::Insert { doc }
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::{ClusterCommand, KestrelCluster};
    use kestrel_common::{KeyValue, ManualWallClock, ShardKeyPattern};

    /// `app.users` on a ranged `k`, split at 50, both halves on shard 1.
    fn split_on_one_shard() -> (Arc<KestrelCluster>, Namespace) {
        let mut config = KestrelConfig::for_tests();
        config.cluster.shards = 2;
        let cluster = KestrelCluster::builder(config)
            .wall_clock(ManualWallClock::new(100))
            .build()
            .unwrap();
        let ns = Namespace::new("app", "users");
        cluster
            .admin(ClusterCommand::EnableSharding {
                db: ns.db.clone(),
                primary: Some(ShardId(1)),
            })
            .unwrap();
        cluster
            .admin(ClusterCommand::ShardCollection {
                ns: ns.clone(),
                key: ShardKeyPattern::ranged(&["k"]),
                unique: false,
                presplit_chunks_per_shard: None,
            })
            .unwrap();
        cluster
            .admin(ClusterCommand::SplitChunk {
                ns: ns.clone(),
                at: ShardKey::single(KeyValue::Int(50)),
            })
            .unwrap();
        (cluster, ns)
    }

    fn insert(k: i64) -> WriteStatement {
        WriteStatement {
            stmt_id: 0,
            op: WriteOp::Insert {
                doc: json!({"_id": k, "k": k}).as_object().cloned().unwrap(),
            },
        }
    }

    #[test]
    fn test_write_rechecks_ownership_under_write_lock() {
        let (cluster, ns) = split_on_one_shard();
        let donor = cluster.shard(ShardId(1)).unwrap();
        let before = cluster
            .catalog()
            .get_collection(&ns)
            .unwrap()
            .chunks
            .shard_version(ShardId(1));
        let filter = donor.check_version(&ns, VersionCheck::Sharded(before)).unwrap();

        // The lower chunk moves away after the check but before the write
        // takes the lock.
        cluster
            .admin(ClusterCommand::MoveChunk {
                ns: ns.clone(),
                range: KeyRange::new(ShardKey::global_min(1), ShardKey::single(KeyValue::Int(50))),
                to: ShardId(2),
            })
            .unwrap();

        let stmt = insert(20);
        let attempt = donor
            .rs
            .write(|w| donor.apply_statement(w, &ns, &filter, &stmt, None))
            .unwrap()
            .value;
        assert!(matches!(attempt, Attempt::Stale));

        let deadline = Instant::now() + Duration::from_secs(5);
        match donor.write_statement(&ns, VersionCheck::Sharded(before), &stmt, None, deadline) {
            Err(e) => assert!(e.is_stale(), "{e}"),
            Ok(_) => panic!("donor accepted a write into a range it no longer owns"),
        }
        let storage = donor.rs.primary_storage().unwrap();
        assert!(storage.get_latest(&ns, &DocKey(KeyValue::Int(20))).is_none());
    }

    #[test]
    fn test_read_with_moved_version_is_stale() {
        let (cluster, ns) = split_on_one_shard();
        let donor = cluster.shard(ShardId(1)).unwrap();
        let before = cluster
            .catalog()
            .get_collection(&ns)
            .unwrap()
            .chunks
            .shard_version(ShardId(1));
        donor.check_version(&ns, VersionCheck::Sharded(before)).unwrap();
        cluster
            .admin(ClusterCommand::MoveChunk {
                ns: ns.clone(),
                range: KeyRange::new(ShardKey::global_min(1), ShardKey::single(KeyValue::Int(50))),
                to: ShardId(2),
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = donor
            .find(&ns, VersionCheck::Sharded(before), &Filter::all(), None, deadline)
            .unwrap_err();
        assert!(err.is_stale(), "{err}");
    }
}
