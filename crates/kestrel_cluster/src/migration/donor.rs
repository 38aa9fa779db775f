//! Donor side of a chunk migration.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use kestrel_common::error::ShardingError;
use kestrel_common::{
    ChunkVersion, DocKey, Document, Epoch, KestrelError, KestrelResult, KeyRange,
    LogicalTimestamp, Namespace, ShardId, ShardKeyPattern,
};
use kestrel_repl::{CrudOp, OplogEntry, OplogOp};
use kestrel_storage::CollectionOptions;

use super::{MigrationDocument, MigrationPhase};
use crate::fault_injection::{
    MIGRATION_CRASH_AFTER_COMMIT, MIGRATION_CRASH_BEFORE_COMMIT, MIGRATION_FAIL_AFTER_CLONE,
};
use crate::messages::{ConfigRequest, RecvChunkStart, ShardRequest};
use crate::shard::{CollectionFilter, CriticalScope, RangeDeletionTask, ShardServer};

/// Oplog entries read per catch-up pass.
const CATCHUP_READ_LIMIT: usize = 4096;
const PREPARED_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub id: String,
    pub docs_cloned: u64,
    pub catchup_rounds: u32,
    /// Version of the moved chunk on the recipient.
    pub version: ChunkVersion,
}

/// Why a phase stopped.
enum PhaseError {
    /// Ownership stays with the donor; clean up and report.
    Abort(String),
    /// The donor stopped as if its process died. Whatever it left is
    /// resolved later from the persisted migration document.
    Crash(KestrelError),
}

impl From<KestrelError> for PhaseError {
    fn from(e: KestrelError) -> Self {
        PhaseError::Abort(e.to_string())
    }
}

type PhaseResult<T> = Result<T, PhaseError>;

/// Changes to ship, keyed by `_id`; `None` deletes.
type Changes = BTreeMap<DocKey, Option<Document>>;

struct DonorMigration<'a> {
    server: &'a ShardServer,
    doc: MigrationDocument,
    pattern: ShardKeyPattern,
    options: CollectionOptions,
    term: u64,
    scope: CriticalScope,
    docs_cloned: u64,
    catchup_rounds: u32,
}

/// Move `range` of `ns` from `server` to `to`. Only one migration per donor
/// runs at a time.
pub(crate) fn move_range(
    server: &ShardServer,
    ns: &Namespace,
    range: &KeyRange,
    to: ShardId,
    epoch: Epoch,
) -> KestrelResult<MigrationOutcome> {
    let Some(_guard) = server.donor_lock.try_lock() else {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "{} is already donating a chunk",
            server.id()
        ))
        .into());
    };
    let started = Instant::now();
    let mut migration = DonorMigration::plan(server, ns, range, to, epoch)?;
    let id = migration.doc.id.clone();
    tracing::info!(
        shard = %server.id(),
        migration = %id,
        to = %to,
        "chunk migration starting"
    );

    match migration.run() {
        Ok(outcome) => {
            kestrel_observability::record_migration(
                "committed",
                outcome.docs_cloned,
                started.elapsed().as_millis() as u64,
            );
            tracing::info!(
                shard = %server.id(),
                migration = %id,
                docs = outcome.docs_cloned,
                rounds = outcome.catchup_rounds,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "chunk migration committed"
            );
            Ok(outcome)
        }
        Err(PhaseError::Abort(reason)) => {
            migration.abort();
            kestrel_observability::record_migration(
                "aborted",
                migration.docs_cloned,
                started.elapsed().as_millis() as u64,
            );
            tracing::warn!(
                shard = %server.id(),
                migration = %id,
                reason = %reason,
                "chunk migration aborted",
            );
            Err(ShardingError::MigrationAborted { id, reason }.into())
        }
        Err(PhaseError::Crash(e)) => {
            server.migration_recovery.store(true, Ordering::Release);
            kestrel_observability::record_migration(
                "interrupted",
                migration.docs_cloned,
                started.elapsed().as_millis() as u64,
            );
            tracing::warn!(
                shard = %server.id(),
                migration = %id,
                error = %e,
                "chunk migration interrupted",
            );
            Err(e)
        }
    }
}

impl<'a> DonorMigration<'a> {
    /// Validate the request against fresh metadata. Nothing is changed yet.
    fn plan(
        server: &'a ShardServer,
        ns: &Namespace,
        range: &KeyRange,
        to: ShardId,
        epoch: Epoch,
    ) -> KestrelResult<Self> {
        if to == server.id() {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "{range} of {ns} is already on {to}"
            ))
            .into());
        }
        let filter = server.refresh_collection(ns)?;
        let Some(routing) = filter.routing() else {
            return Err(ShardingError::NotSharded(ns.to_string()).into());
        };
        if routing.epoch() != epoch {
            return Err(ShardingError::StaleConfig {
                ns: ns.to_string(),
                shard: server.id(),
                received: None,
                wanted: Some(routing.chunks.shard_version(server.id())),
            }
            .into());
        }
        let chunk = routing.chunks.chunk_with_range(range).ok_or_else(|| {
            ShardingError::InvalidChunkOperation(format!("{ns} has no chunk {range}"))
        })?;
        if chunk.shard != server.id() {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "chunk {range} is owned by {}, not {}",
                chunk.shard,
                server.id()
            ))
            .into());
        }
        if chunk.jumbo {
            return Err(
                ShardingError::InvalidChunkOperation(format!("chunk {range} is jumbo")).into(),
            );
        }
        let rs = server.replica_set();
        let storage = rs.primary_storage()?;
        let options = match storage.collection_info(ns) {
            Some(info) if info.uuid != routing.entry.uuid => {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "{ns} is being recreated"
                ))
                .into())
            }
            Some(info) => info.options,
            None => CollectionOptions::default(),
        };
        Ok(Self {
            server,
            doc: MigrationDocument {
                id: MigrationDocument::id_for(ns, range),
                ns: ns.clone(),
                uuid: routing.entry.uuid,
                epoch,
                range: range.clone(),
                donor: server.id(),
                recipient: to,
                phase: MigrationPhase::Cloning,
                last_applied_donor_ts: LogicalTimestamp::MIN,
                started_wall_secs: rs.clock().wall_secs(),
            },
            pattern: routing.entry.key_pattern.clone(),
            options,
            term: rs.term(),
            scope: CriticalScope::Range {
                ns: ns.clone(),
                range: range.clone(),
            },
            docs_cloned: 0,
            catchup_rounds: 0,
        })
    }

    fn run(&mut self) -> PhaseResult<MigrationOutcome> {
        self.persist()?;
        self.clone_range()?;
        self.server
            .failpoints()
            .check(MIGRATION_FAIL_AFTER_CLONE, self.server.id())
            .map_err(|e| PhaseError::Abort(e.to_string()))?;
        self.catch_up()?;
        self.enter_critical_section()?;
        let version = self.commit()?;
        self.cleanup()?;
        Ok(MigrationOutcome {
            id: self.doc.id.clone(),
            docs_cloned: self.docs_cloned,
            catchup_rounds: self.catchup_rounds,
            version,
        })
    }

    fn persist(&self) -> KestrelResult<()> {
        self.server
            .rpc()
            .config(ConfigRequest::PersistMigration(self.doc.clone()))?
            .into_ok()
    }

    fn send(&self, req: ShardRequest) -> KestrelResult<()> {
        self.server.rpc().shard(self.doc.recipient, req)?.into_ok()
    }

    fn in_range(&self, doc: &Document) -> bool {
        self.pattern
            .extract(doc)
            .is_some_and(|k| self.doc.range.contains(&k))
    }

    // ── Cloning ──

    fn clone_range(&mut self) -> PhaseResult<()> {
        let rs = self.server.replica_set();
        let ns = self.doc.ns.clone();
        let pattern = self.pattern.clone();
        let range = self.doc.range.clone();
        // Scan and oplog position taken together under the write lock, so
        // catch-up starts exactly where the snapshot ends.
        let (docs, snapshot_ts) = rs
            .write(|w| {
                let docs = w.storage().scan_latest_where(&ns, |d| {
                    pattern.extract(d).is_some_and(|k| range.contains(&k))
                });
                Ok((docs, w.node().oplog().last_optime().ts))
            })?
            .value;

        self.send(ShardRequest::RecvChunkStart(RecvChunkStart {
            migration_id: self.doc.id.clone(),
            ns: ns.clone(),
            uuid: self.doc.uuid,
            options: self.options,
            pattern: self.pattern.clone(),
            range: self.doc.range.clone(),
            donor: self.server.id(),
        }))?;

        let batch_size = self.server.migration_config().clone_batch_size.max(1);
        self.docs_cloned = docs.len() as u64;
        let mut docs = docs.into_iter().peekable();
        while docs.peek().is_some() {
            let upserts: Vec<Document> = docs.by_ref().take(batch_size).collect();
            self.send(ShardRequest::RecvChunkBatch {
                migration_id: self.doc.id.clone(),
                upserts,
                deletes: Vec::new(),
            })?;
        }
        self.doc.last_applied_donor_ts = snapshot_ts;
        self.doc.phase = MigrationPhase::CatchingUp;
        self.persist()?;
        tracing::debug!(
            shard = %self.server.id(),
            migration = %self.doc.id,
            docs = self.docs_cloned,
            snapshot_ts = %snapshot_ts,
            "range cloned"
        );
        Ok(())
    }

    // ── Catch-up ──

    /// Ship donor writes until a pass finds nothing new.
    fn catch_up(&mut self) -> PhaseResult<()> {
        let max_rounds = self.server.migration_config().max_catchup_rounds;
        loop {
            if self.drain()? == 0 {
                return Ok(());
            }
            self.catchup_rounds += 1;
            if self.catchup_rounds >= max_rounds {
                return Err(PhaseError::Abort(format!(
                    "catch-up did not converge after {} rounds",
                    self.catchup_rounds
                )));
            }
        }
    }

    /// One pass over the donor oplog since the last shipped entry. Returns
    /// the number of documents shipped.
    fn drain(&mut self) -> PhaseResult<usize> {
        let rs = self.server.replica_set();
        if rs.term() != self.term {
            return Err(PhaseError::Abort("donor primary changed".into()));
        }
        let primary = rs.primary()?;
        let oplog = primary.oplog();
        let mut changes = Changes::new();
        loop {
            let entries = oplog.read_after(self.doc.last_applied_donor_ts, CATCHUP_READ_LIMIT);
            let Some(last) = entries.last().map(|e| e.ts) else {
                break;
            };
            for entry in &entries {
                self.collect(entry, oplog, &mut changes)?;
            }
            self.doc.last_applied_donor_ts = last;
        }
        if changes.is_empty() {
            return Ok(0);
        }
        let shipped = changes.len();
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (key, doc) in changes {
            match doc {
                Some(d) => upserts.push(d),
                None => deletes.push(key),
            }
        }
        self.send(ShardRequest::RecvChunkBatch {
            migration_id: self.doc.id.clone(),
            upserts,
            deletes,
        })?;
        tracing::debug!(
            shard = %self.server.id(),
            migration = %self.doc.id,
            shipped,
            through = %self.doc.last_applied_donor_ts,
            "catch-up batch shipped"
        );
        Ok(shipped)
    }

    fn collect(
        &self,
        entry: &OplogEntry,
        oplog: &kestrel_repl::Oplog,
        changes: &mut Changes,
    ) -> PhaseResult<()> {
        let ns = &self.doc.ns;
        match &entry.op {
            OplogOp::Crud(op) if entry.ns == *ns && !entry.from_migrate => {
                self.collect_op(op, changes)?;
            }
            OplogOp::ApplyOps { ops, prepare: false } => {
                for op in ops.iter().filter(|o| o.ns == *ns) {
                    self.collect_op(&op.op, changes)?;
                }
            }
            OplogOp::CommitTransaction { prepare_ts, .. } => {
                let prepared = oplog.find(*prepare_ts).ok_or_else(|| {
                    PhaseError::Abort(format!("prepare entry at {prepare_ts} was truncated"))
                })?;
                if let OplogOp::ApplyOps { ops, .. } = &prepared.op {
                    for op in ops.iter().filter(|o| o.ns == *ns) {
                        self.collect_op(&op.op, changes)?;
                    }
                }
            }
            OplogOp::Drop | OplogOp::ReshardCollection { .. } if entry.ns == *ns => {
                return Err(PhaseError::Abort(format!("{ns} was dropped")));
            }
            OplogOp::DropDatabase if entry.ns.db == ns.db => {
                return Err(PhaseError::Abort(format!("database {} was dropped", ns.db)));
            }
            _ => {}
        }
        Ok(())
    }

    fn collect_op(&self, op: &CrudOp, changes: &mut Changes) -> KestrelResult<()> {
        let key = op.doc_key()?;
        match op.post_image() {
            Some(doc) if self.in_range(doc) => {
                changes.insert(key, Some(doc.clone()));
            }
            // Deleted, or moved out of the range by a shard key change.
            _ => {
                changes.insert(key, None);
            }
        }
        Ok(())
    }

    // ── Critical section and commit ──

    fn enter_critical_section(&mut self) -> PhaseResult<()> {
        let server = self.server;
        let ns = self.doc.ns.clone();
        server
            .critical_sections()
            .enter(self.scope.clone(), &format!("migration {}", self.doc.id))?;
        // Writes that passed the section check before it existed finish
        // under the write lock.
        server.replica_set().write(|_| Ok(()))?;
        server.participant().abort_active_on(&ns);

        let deadline = Instant::now() + server.migration_config().critical_section_timeout();
        while server.participant().prepared_on(&ns) > 0 {
            if Instant::now() >= deadline {
                return Err(PhaseError::Abort(format!(
                    "prepared transactions on {ns} did not resolve"
                )));
            }
            std::thread::sleep(PREPARED_POLL);
        }
        self.drain()?;
        server.critical_sections().block_reads(&self.scope);
        self.doc.phase = MigrationPhase::CommitPending;
        self.persist()?;
        Ok(())
    }

    fn commit(&mut self) -> PhaseResult<ChunkVersion> {
        let server = self.server;
        let sessions = server
            .sessions()
            .sessions_in_range(&self.doc.ns, &self.doc.range);
        self.send(ShardRequest::RecvChunkCommit {
            migration_id: self.doc.id.clone(),
            sessions,
        })?;

        if let Err(e) = server
            .failpoints()
            .check(MIGRATION_CRASH_BEFORE_COMMIT, server.id())
        {
            server.critical_sections().exit(&self.scope);
            return Err(PhaseError::Crash(e));
        }

        let committed = server
            .rpc()
            .config(ConfigRequest::CommitChunkMigration {
                ns: self.doc.ns.clone(),
                epoch: self.doc.epoch,
                range: self.doc.range.clone(),
                donor: server.id(),
                recipient: self.doc.recipient,
            })
            .and_then(|r| r.into_migration_committed());
        let version = match committed {
            Ok(pair) => pair.moved,
            Err(e) => {
                // The commit may have landed anyway; the catalog decides.
                tracing::warn!(
                    shard = %server.id(),
                    migration = %self.doc.id,
                    error = %e,
                    "commit outcome unknown, consulting catalog",
                );
                server.metadata().forget_collection(&self.doc.ns);
                match self.owner_of_range() {
                    Ok(Some((owner, version))) if owner == self.doc.recipient => version,
                    Ok(_) => return Err(PhaseError::Abort(e.to_string())),
                    Err(lookup) => {
                        server.critical_sections().exit(&self.scope);
                        return Err(PhaseError::Crash(lookup));
                    }
                }
            }
        };

        if let Err(e) = server
            .failpoints()
            .check(MIGRATION_CRASH_AFTER_COMMIT, server.id())
        {
            server.metadata().forget_collection(&self.doc.ns);
            server.critical_sections().exit(&self.scope);
            return Err(PhaseError::Crash(e));
        }
        self.doc.phase = MigrationPhase::Committed;
        Ok(version)
    }

    fn owner_of_range(&self) -> KestrelResult<Option<(ShardId, ChunkVersion)>> {
        let filter = self.server.refresh_collection(&self.doc.ns)?;
        Ok(filter.routing().and_then(|r| {
            if r.epoch() != self.doc.epoch {
                return None;
            }
            r.chunks
                .chunk_for(&self.doc.range.min)
                .map(|c| (c.shard, c.version))
        }))
    }

    /// Post-commit: new metadata first, then let writers in, then schedule
    /// the orphaned copy for deletion.
    fn cleanup(&mut self) -> PhaseResult<()> {
        let server = self.server;
        server.metadata().forget_collection(&self.doc.ns);
        if let Err(e) = server.refresh_collection(&self.doc.ns) {
            tracing::debug!(
                shard = %server.id(),
                ns = %self.doc.ns,
                error = %e,
                "refresh after commit failed",
            );
        }
        server.critical_sections().exit(&self.scope);
        let committed = schedule_cleanup(server, &self.doc).and_then(|()| {
            server
                .rpc()
                .config(ConfigRequest::RemoveMigration {
                    id: self.doc.id.clone(),
                })?
                .into_ok()
        });
        // Ownership already moved; recovery finishes the bookkeeping.
        if let Err(e) = committed {
            server.migration_recovery.store(true, Ordering::Release);
            tracing::warn!(
                shard = %server.id(),
                migration = %self.doc.id,
                error = %e,
                "post-commit cleanup deferred",
            );
        }
        Ok(())
    }

    fn abort(&self) {
        let server = self.server;
        server.critical_sections().exit(&self.scope);
        if let Err(e) = self.send(ShardRequest::RecvChunkAbort {
            migration_id: self.doc.id.clone(),
        }) {
            tracing::debug!(
                shard = %server.id(),
                migration = %self.doc.id,
                error = %e,
                "recipient abort not delivered",
            );
        }
        let removed = server
            .rpc()
            .config(ConfigRequest::RemoveMigration {
                id: self.doc.id.clone(),
            })
            .and_then(|r| r.into_ok());
        if removed.is_err() {
            server.migration_recovery.store(true, Ordering::Release);
        }
    }
}

fn schedule_cleanup(server: &ShardServer, doc: &MigrationDocument) -> KestrelResult<()> {
    let pattern = match server.filter_for(&doc.ns)? {
        CollectionFilter::Sharded(r) => r.entry.key_pattern.clone(),
        CollectionFilter::Unsharded => return Ok(()),
    };
    server.range_deleter().schedule(
        server.replica_set(),
        RangeDeletionTask {
            id: doc.id.clone(),
            ns: doc.ns.clone(),
            uuid: doc.uuid,
            range: doc.range.clone(),
            pattern,
        },
    )
}

/// Resolve migrations this shard left unfinished, using the catalog's
/// chunk ownership as the decision. Returns migrations resolved.
pub(crate) fn recover(server: &ShardServer) -> KestrelResult<usize> {
    let Some(_guard) = server.donor_lock.try_lock() else {
        // A live migration finishes its own bookkeeping.
        server.migration_recovery.store(true, Ordering::Release);
        return Ok(0);
    };
    let docs = server
        .rpc()
        .config(ConfigRequest::MigrationsForDonor { donor: server.id() })?
        .into_migrations()?;
    let mut resolved = 0;
    for doc in docs {
        let scope = CriticalScope::Range {
            ns: doc.ns.clone(),
            range: doc.range.clone(),
        };
        server.metadata().forget_collection(&doc.ns);
        let filter = server.refresh_collection(&doc.ns)?;
        let owner = filter
            .routing()
            .filter(|r| r.epoch() == doc.epoch)
            .and_then(|r| r.chunks.chunk_for(&doc.range.min).map(|c| c.shard));
        let committed = owner == Some(doc.recipient);
        if committed {
            schedule_cleanup(server, &doc)?;
        } else if let Err(e) = server.rpc().shard(
            doc.recipient,
            ShardRequest::RecvChunkAbort {
                migration_id: doc.id.clone(),
            },
        ) {
            // The recipient purges unowned documents on its next start.
            tracing::debug!(
                shard = %server.id(),
                migration = %doc.id,
                error = %e,
                "recipient abort not delivered",
            );
        }
        server.critical_sections().exit(&scope);
        server
            .rpc()
            .config(ConfigRequest::RemoveMigration { id: doc.id.clone() })?
            .into_ok()?;
        resolved += 1;
        tracing::info!(
            shard = %server.id(),
            migration = %doc.id,
            phase = doc.phase.as_str(),
            committed,
            "unfinished migration resolved"
        );
    }
    Ok(resolved)
}
