//! Request and response bodies exchanged over the cluster transport.

use serde::{Deserialize, Serialize};

use kestrel_common::{
    ChunkVersion, CollectionUuid, DatabaseVersion, DocKey, Document, Epoch, Filter, KestrelError,
    KestrelResult, KeyRange, KeyValue, Lsid, LogicalTimestamp, Namespace, ShardId, ShardKey,
    ShardKeyPattern, StmtId, TxnKey, TxnNumber, UpdateSpec, WriteConcern,
};
use kestrel_storage::CollectionOptions;

use crate::catalog::{
    ChunkVersionPair, DatabaseEntry, FcvState, RoutingUpdate, ShardEntry,
};
use crate::change_stream::{ShardChangeBatch, ShardStreamRequest};
use crate::migration::{MigrationDocument, MigrationOutcome};
use crate::shard::{CriticalScope, MigratedSession};
use crate::txn::CommitDecision;

/// The routing version a request was targeted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionCheck {
    /// Internal traffic that bypasses ownership checks.
    Unchecked,
    /// The sender believes the collection is sharded and that the target
    /// shard is at this shard version.
    Sharded(ChunkVersion),
    /// The sender believes the collection is unsharded and lives on the
    /// database primary at this database version.
    Unsharded(DatabaseVersion),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Insert {
        doc: Document,
    },
    Update {
        filter: Filter,
        update: UpdateSpec,
        upsert: bool,
        multi: bool,
    },
    Delete {
        filter: Filter,
        multi: bool,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteStatement {
    pub stmt_id: StmtId,
    pub op: WriteOp,
}

/// Session identity attached to retryable writes and transaction statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub lsid: Lsid,
    pub txn_number: TxnNumber,
    /// Present when the statement belongs to a multi-statement transaction.
    pub txn: Option<TxnStatement>,
}

impl SessionContext {
    pub fn key(&self) -> TxnKey {
        TxnKey::new(self.lsid, self.txn_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatement {
    /// Snapshot every statement of the transaction reads at.
    pub read_ts: LogicalTimestamp,
    /// First statement this shard sees for the transaction.
    pub start: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub n: u64,
    pub n_modified: u64,
    pub upserted: Vec<KeyValue>,
}

impl WriteResult {
    pub fn merge(&mut self, other: WriteResult) {
        self.n += other.n;
        self.n_modified += other.n_modified;
        self.upserted.extend(other.upserted);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub docs: u64,
    pub bytes: u64,
    /// Documents this shard holds but does not own.
    pub orphans: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub options: CollectionOptions,
}

/// Split points for a range, with the bytes the shard holds in it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitVector {
    pub points: Vec<ShardKey>,
    pub range_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecvChunkStart {
    pub migration_id: String,
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub options: CollectionOptions,
    pub pattern: ShardKeyPattern,
    pub range: KeyRange,
    pub donor: ShardId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardRequest {
    // ── Client data path ──
    Write {
        ns: Namespace,
        version: VersionCheck,
        statements: Vec<WriteStatement>,
        session: Option<SessionContext>,
        write_concern: WriteConcern,
    },
    Find {
        ns: Namespace,
        version: VersionCheck,
        filter: Filter,
        session: Option<SessionContext>,
    },

    // ── Transactions ──
    PrepareTransaction {
        key: TxnKey,
    },
    /// `commit_ts` is `None` for a transaction that only touched this shard.
    CommitTransaction {
        key: TxnKey,
        commit_ts: Option<LogicalTimestamp>,
    },
    AbortTransaction {
        key: TxnKey,
    },
    CoordinateCommit {
        key: TxnKey,
        participants: Vec<ShardId>,
    },

    // ── Change streams ──
    ChangeStreamFetch(ShardStreamRequest),
    ListCollections {
        db: Option<String>,
    },

    // ── Migration ──
    MoveRange {
        ns: Namespace,
        range: KeyRange,
        to: ShardId,
        epoch: Epoch,
    },
    RecvChunkStart(RecvChunkStart),
    RecvChunkBatch {
        migration_id: String,
        upserts: Vec<Document>,
        deletes: Vec<DocKey>,
    },
    RecvChunkCommit {
        migration_id: String,
        sessions: Vec<MigratedSession>,
    },
    RecvChunkAbort {
        migration_id: String,
    },

    // ── Metadata ──
    RefreshCollection {
        ns: Namespace,
    },
    RefreshDatabase {
        db: String,
    },
    EnterCriticalSection {
        scope: CriticalScope,
        reason: String,
        block_reads: bool,
    },
    ExitCriticalSection {
        scope: CriticalScope,
    },
    SetFcv {
        state: FcvState,
    },

    // ── DDL ──
    CreateCollection {
        ns: Namespace,
        uuid: Option<CollectionUuid>,
        options: CollectionOptions,
        from_migrate: bool,
    },
    CollMod {
        ns: Namespace,
        options: CollectionOptions,
    },
    DropCollection {
        ns: Namespace,
        from_migrate: bool,
    },
    DropDatabase {
        db: String,
        from_migrate: bool,
    },
    /// Every document this shard owns in `ns`.
    DumpCollection {
        ns: Namespace,
    },
    InstallCollection {
        collection: CollectionDescription,
        docs: Vec<Document>,
    },
    /// Replace `ns` with a new incarnation holding `docs`. The database
    /// primary also records the reshard for change streams.
    ReshardInstall {
        ns: Namespace,
        new_uuid: CollectionUuid,
        key_pattern: ShardKeyPattern,
        docs: Vec<Document>,
        announce: bool,
    },
    CollectionStats {
        ns: Namespace,
    },
    /// Keys splitting `range` into pieces of at most `max_bytes`.
    SplitVector {
        ns: Namespace,
        range: KeyRange,
        max_bytes: u64,
    },
}

impl ShardRequest {
    /// Stable name used for metrics and fault injection.
    pub fn kind(&self) -> &'static str {
        match self {
            ShardRequest::Write { .. } => "write",
            ShardRequest::Find { .. } => "find",
            ShardRequest::PrepareTransaction { .. } => "prepareTransaction",
            ShardRequest::CommitTransaction { .. } => "commitTransaction",
            ShardRequest::AbortTransaction { .. } => "abortTransaction",
            ShardRequest::CoordinateCommit { .. } => "coordinateCommitTransaction",
            ShardRequest::ChangeStreamFetch(_) => "changeStreamFetch",
            ShardRequest::ListCollections { .. } => "listCollections",
            ShardRequest::MoveRange { .. } => "moveRange",
            ShardRequest::RecvChunkStart(_) => "recvChunkStart",
            ShardRequest::RecvChunkBatch { .. } => "recvChunkBatch",
            ShardRequest::RecvChunkCommit { .. } => "recvChunkCommit",
            ShardRequest::RecvChunkAbort { .. } => "recvChunkAbort",
            ShardRequest::RefreshCollection { .. } => "refreshCollection",
            ShardRequest::RefreshDatabase { .. } => "refreshDatabase",
            ShardRequest::EnterCriticalSection { .. } => "enterCriticalSection",
            ShardRequest::ExitCriticalSection { .. } => "exitCriticalSection",
            ShardRequest::SetFcv { .. } => "setFeatureCompatibilityVersion",
            ShardRequest::CreateCollection { .. } => "create",
            ShardRequest::CollMod { .. } => "collMod",
            ShardRequest::DropCollection { .. } => "drop",
            ShardRequest::DropDatabase { .. } => "dropDatabase",
            ShardRequest::DumpCollection { .. } => "dumpCollection",
            ShardRequest::InstallCollection { .. } => "installCollection",
            ShardRequest::ReshardInstall { .. } => "reshardInstall",
            ShardRequest::CollectionStats { .. } => "collStats",
            ShardRequest::SplitVector { .. } => "splitVector",
        }
    }

    /// Requests any authenticated user may send; everything else is
    /// cluster-internal.
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            ShardRequest::Write { .. } | ShardRequest::Find { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardResponse {
    Ok,
    Written(WriteResult),
    Docs(Vec<Document>),
    Prepared { prepare_ts: LogicalTimestamp },
    Decision(CommitDecision),
    Changes(ShardChangeBatch),
    Collections(Vec<CollectionDescription>),
    Migrated(MigrationOutcome),
    Stats(CollectionStats),
    SplitPoints(SplitVector),
}

fn unexpected(wanted: &str, got: &impl std::fmt::Debug) -> KestrelError {
    KestrelError::internal_bug(
        "E-RPC-001",
        format!("expected {wanted} response"),
        format!("{got:?}"),
    )
}

impl ShardResponse {
    pub fn into_ok(self) -> KestrelResult<()> {
        match self {
            ShardResponse::Ok => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    pub fn into_written(self) -> KestrelResult<WriteResult> {
        match self {
            ShardResponse::Written(r) => Ok(r),
            other => Err(unexpected("write", &other)),
        }
    }

    pub fn into_docs(self) -> KestrelResult<Vec<Document>> {
        match self {
            ShardResponse::Docs(d) => Ok(d),
            other => Err(unexpected("documents", &other)),
        }
    }

    pub fn into_prepare_ts(self) -> KestrelResult<LogicalTimestamp> {
        match self {
            ShardResponse::Prepared { prepare_ts } => Ok(prepare_ts),
            other => Err(unexpected("prepare", &other)),
        }
    }

    pub fn into_decision(self) -> KestrelResult<CommitDecision> {
        match self {
            ShardResponse::Decision(d) => Ok(d),
            other => Err(unexpected("decision", &other)),
        }
    }

    pub fn into_changes(self) -> KestrelResult<ShardChangeBatch> {
        match self {
            ShardResponse::Changes(c) => Ok(c),
            other => Err(unexpected("change batch", &other)),
        }
    }

    pub fn into_collections(self) -> KestrelResult<Vec<CollectionDescription>> {
        match self {
            ShardResponse::Collections(c) => Ok(c),
            other => Err(unexpected("collections", &other)),
        }
    }

    pub fn into_migrated(self) -> KestrelResult<MigrationOutcome> {
        match self {
            ShardResponse::Migrated(m) => Ok(m),
            other => Err(unexpected("migration", &other)),
        }
    }

    pub fn into_stats(self) -> KestrelResult<CollectionStats> {
        match self {
            ShardResponse::Stats(s) => Ok(s),
            other => Err(unexpected("stats", &other)),
        }
    }

    pub fn into_split_points(self) -> KestrelResult<SplitVector> {
        match self {
            ShardResponse::SplitPoints(p) => Ok(p),
            other => Err(unexpected("split points", &other)),
        }
    }
}

// ── Config server ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigRequest {
    /// With `create`, a missing database is created on the least-loaded shard.
    GetDatabase {
        db: String,
        create: bool,
    },
    GetRouting {
        ns: Namespace,
        since: Option<ChunkVersion>,
    },
    ListShards,
    CommitChunkMigration {
        ns: Namespace,
        epoch: Epoch,
        range: KeyRange,
        donor: ShardId,
        recipient: ShardId,
    },
    PersistMigration(MigrationDocument),
    RemoveMigration {
        id: String,
    },
    MigrationsForDonor {
        donor: ShardId,
    },
    GetFcv,
}

impl ConfigRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigRequest::GetDatabase { .. } => "getDatabase",
            ConfigRequest::GetRouting { .. } => "getRouting",
            ConfigRequest::ListShards => "listShards",
            ConfigRequest::CommitChunkMigration { .. } => "commitChunkMigration",
            ConfigRequest::PersistMigration(_) => "persistMigration",
            ConfigRequest::RemoveMigration { .. } => "removeMigration",
            ConfigRequest::MigrationsForDonor { .. } => "migrationsForDonor",
            ConfigRequest::GetFcv => "getFcv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigResponse {
    Ok,
    Database(Option<DatabaseEntry>),
    Routing(RoutingUpdate),
    Shards(Vec<ShardEntry>),
    MigrationCommitted(ChunkVersionPair),
    Migrations(Vec<MigrationDocument>),
    Fcv(FcvState),
}

impl ConfigResponse {
    pub fn into_ok(self) -> KestrelResult<()> {
        match self {
            ConfigResponse::Ok => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    pub fn into_database(self) -> KestrelResult<Option<DatabaseEntry>> {
        match self {
            ConfigResponse::Database(d) => Ok(d),
            other => Err(unexpected("database", &other)),
        }
    }

    pub fn into_routing(self) -> KestrelResult<RoutingUpdate> {
        match self {
            ConfigResponse::Routing(r) => Ok(r),
            other => Err(unexpected("routing", &other)),
        }
    }

    pub fn into_shards(self) -> KestrelResult<Vec<ShardEntry>> {
        match self {
            ConfigResponse::Shards(s) => Ok(s),
            other => Err(unexpected("shards", &other)),
        }
    }

    pub fn into_migration_committed(self) -> KestrelResult<ChunkVersionPair> {
        match self {
            ConfigResponse::MigrationCommitted(v) => Ok(v),
            other => Err(unexpected("migration commit", &other)),
        }
    }

    pub fn into_migrations(self) -> KestrelResult<Vec<MigrationDocument>> {
        match self {
            ConfigResponse::Migrations(m) => Ok(m),
            other => Err(unexpected("migrations", &other)),
        }
    }

    pub fn into_fcv(self) -> KestrelResult<FcvState> {
        match self {
            ConfigResponse::Fcv(f) => Ok(f),
            other => Err(unexpected("fcv", &other)),
        }
    }
}
