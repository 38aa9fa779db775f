//! Cluster control surface.
//!
//! Operator commands are one sum type, [`ClusterCommand`], dispatched
//! through a handler table keyed by [`CommandKind`]. Every command is
//! authorized as `ClusterManage` on the resource it touches. Long-running
//! commands register an operation whose status can be polled with
//! `GetOperationStatus`, and may be started in the background with
//! [`ClusterControl::submit`].
//!
//! Handlers run next to the config server: they mutate the [`ShardCatalog`]
//! directly and drive shards through internal RPCs.

pub mod chunks;
pub mod ddl;
pub mod operations;
pub mod resharding;
pub mod topology;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::authz::{Action, AuthzGate, Principal, Resource};
use kestrel_common::error::ShardingError;
use kestrel_common::{
    ChunkVersion, Epoch, KestrelError, KestrelResult, KeyRange, Namespace, ShardId, ShardKey,
    ShardKeyPattern,
};
use kestrel_storage::CollectionOptions;

use crate::catalog::{
    DatabaseEntry, FcvState, FeatureVersion, RemoveShardStatus, ShardCatalog, ShardEntry,
};
use crate::messages::{CollectionStats, ShardRequest, ShardResponse};
use crate::migration::MigrationOutcome;
use crate::shard::CriticalScope;
use crate::transport::RpcClient;

pub use operations::{OperationId, OperationRegistry, OperationState, OperationStatus};

const MAX_TRACKED_OPERATIONS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    AddShard {
        shard: ShardId,
    },
    /// Start draining, or report progress of, a shard's removal.
    RemoveShard {
        shard: ShardId,
    },
    ListShards,
    EnableSharding {
        db: String,
        primary: Option<ShardId>,
    },
    MovePrimary {
        db: String,
        to: ShardId,
    },
    ShardCollection {
        ns: Namespace,
        key: ShardKeyPattern,
        unique: bool,
        /// Hashed keys only: chunks to create per shard up front.
        presplit_chunks_per_shard: Option<usize>,
    },
    SplitChunk {
        ns: Namespace,
        at: ShardKey,
    },
    MergeChunks {
        ns: Namespace,
        range: KeyRange,
    },
    MoveChunk {
        ns: Namespace,
        range: KeyRange,
        to: ShardId,
    },
    ReshardCollection {
        ns: Namespace,
        key: ShardKeyPattern,
    },
    CreateCollection {
        ns: Namespace,
        options: CollectionOptions,
    },
    CollMod {
        ns: Namespace,
        options: CollectionOptions,
    },
    DropCollection {
        ns: Namespace,
    },
    DropDatabase {
        db: String,
    },
    SetFcv {
        version: FeatureVersion,
    },
    CollectionStats {
        ns: Namespace,
    },
    GetOperationStatus {
        id: OperationId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    AddShard,
    RemoveShard,
    ListShards,
    EnableSharding,
    MovePrimary,
    ShardCollection,
    SplitChunk,
    MergeChunks,
    MoveChunk,
    ReshardCollection,
    CreateCollection,
    CollMod,
    DropCollection,
    DropDatabase,
    SetFcv,
    CollectionStats,
    GetOperationStatus,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::AddShard => "addShard",
            CommandKind::RemoveShard => "removeShard",
            CommandKind::ListShards => "listShards",
            CommandKind::EnableSharding => "enableSharding",
            CommandKind::MovePrimary => "movePrimary",
            CommandKind::ShardCollection => "shardCollection",
            CommandKind::SplitChunk => "splitChunk",
            CommandKind::MergeChunks => "mergeChunks",
            CommandKind::MoveChunk => "moveChunk",
            CommandKind::ReshardCollection => "reshardCollection",
            CommandKind::CreateCollection => "create",
            CommandKind::CollMod => "collMod",
            CommandKind::DropCollection => "drop",
            CommandKind::DropDatabase => "dropDatabase",
            CommandKind::SetFcv => "setFeatureCompatibilityVersion",
            CommandKind::CollectionStats => "collStats",
            CommandKind::GetOperationStatus => "getOperationStatus",
        }
    }

    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            CommandKind::MoveChunk | CommandKind::ReshardCollection | CommandKind::RemoveShard
        )
    }

    /// Commands that change catalog shape run one at a time.
    fn is_serialized(&self) -> bool {
        !matches!(
            self,
            CommandKind::ListShards
                | CommandKind::CollectionStats
                | CommandKind::GetOperationStatus
                | CommandKind::MoveChunk
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ClusterCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ClusterCommand::AddShard { .. } => CommandKind::AddShard,
            ClusterCommand::RemoveShard { .. } => CommandKind::RemoveShard,
            ClusterCommand::ListShards => CommandKind::ListShards,
            ClusterCommand::EnableSharding { .. } => CommandKind::EnableSharding,
            ClusterCommand::MovePrimary { .. } => CommandKind::MovePrimary,
            ClusterCommand::ShardCollection { .. } => CommandKind::ShardCollection,
            ClusterCommand::SplitChunk { .. } => CommandKind::SplitChunk,
            ClusterCommand::MergeChunks { .. } => CommandKind::MergeChunks,
            ClusterCommand::MoveChunk { .. } => CommandKind::MoveChunk,
            ClusterCommand::ReshardCollection { .. } => CommandKind::ReshardCollection,
            ClusterCommand::CreateCollection { .. } => CommandKind::CreateCollection,
            ClusterCommand::CollMod { .. } => CommandKind::CollMod,
            ClusterCommand::DropCollection { .. } => CommandKind::DropCollection,
            ClusterCommand::DropDatabase { .. } => CommandKind::DropDatabase,
            ClusterCommand::SetFcv { .. } => CommandKind::SetFcv,
            ClusterCommand::CollectionStats { .. } => CommandKind::CollectionStats,
            ClusterCommand::GetOperationStatus { .. } => CommandKind::GetOperationStatus,
        }
    }

    /// What the command is authorized against.
    pub fn resource(&self) -> Resource {
        let coll = |ns: &Namespace| Resource::Collection {
            db: ns.db.clone(),
            coll: ns.coll.clone(),
        };
        match self {
            ClusterCommand::EnableSharding { db, .. }
            | ClusterCommand::MovePrimary { db, .. }
            | ClusterCommand::DropDatabase { db } => Resource::Database(db.clone()),
            ClusterCommand::ShardCollection { ns, .. }
            | ClusterCommand::SplitChunk { ns, .. }
            | ClusterCommand::MergeChunks { ns, .. }
            | ClusterCommand::MoveChunk { ns, .. }
            | ClusterCommand::ReshardCollection { ns, .. }
            | ClusterCommand::CreateCollection { ns, .. }
            | ClusterCommand::CollMod { ns, .. }
            | ClusterCommand::DropCollection { ns }
            | ClusterCommand::CollectionStats { ns } => coll(ns),
            ClusterCommand::AddShard { .. }
            | ClusterCommand::RemoveShard { .. }
            | ClusterCommand::ListShards
            | ClusterCommand::SetFcv { .. }
            | ClusterCommand::GetOperationStatus { .. } => Resource::Cluster,
        }
    }

    fn describe(&self) -> String {
        match self {
            ClusterCommand::MoveChunk { ns, range, to } => format!("{ns} {range} -> {to}"),
            ClusterCommand::ReshardCollection { ns, key } => format!("{ns} -> {key}"),
            ClusterCommand::RemoveShard { shard } => shard.to_string(),
            other => other.kind().name().to_string(),
        }
    }
}

/// Per-collection statistics summed over shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCollectionStats {
    pub total: CollectionStats,
    pub per_shard: Vec<(ShardId, CollectionStats)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandReply {
    Ok,
    Shard(ShardEntry),
    Shards(Vec<ShardEntry>),
    RemoveShard(RemoveShardStatus),
    Database(DatabaseEntry),
    Collection {
        ns: Namespace,
        epoch: Epoch,
        version: ChunkVersion,
        chunks: usize,
    },
    Split {
        left: KeyRange,
        right: KeyRange,
    },
    Merged(KeyRange),
    Migrated(MigrationOutcome),
    Fcv(FcvState),
    Stats(ClusterCollectionStats),
    Operation(OperationStatus),
}

type Handler = fn(&ClusterControl, ClusterCommand) -> KestrelResult<CommandReply>;

#[derive(Debug, Default)]
struct ControlMetrics {
    commands: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub commands: u64,
    pub failed: u64,
    pub rejected: u64,
    pub running_operations: usize,
}

pub struct ClusterControl {
    catalog: Arc<ShardCatalog>,
    rpc: RpcClient,
    authz: Arc<dyn AuthzGate>,
    handlers: HashMap<CommandKind, Handler>,
    operations: OperationRegistry,
    ddl_lock: Mutex<()>,
    metrics: ControlMetrics,
}

impl fmt::Debug for ClusterControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterControl")
            .field("handlers", &self.handlers.len())
            .field("running", &self.operations.running().len())
            .finish()
    }
}

impl ClusterControl {
    /// `rpc` must act as an internal principal.
    pub fn new(
        catalog: Arc<ShardCatalog>,
        rpc: RpcClient,
        authz: Arc<dyn AuthzGate>,
    ) -> Arc<Self> {
        let mut handlers: HashMap<CommandKind, Handler> = HashMap::new();
        handlers.insert(CommandKind::AddShard, topology::add_shard);
        handlers.insert(CommandKind::RemoveShard, topology::remove_shard);
        handlers.insert(CommandKind::ListShards, topology::list_shards);
        handlers.insert(CommandKind::SetFcv, topology::set_fcv);
        handlers.insert(CommandKind::GetOperationStatus, topology::operation_status);
        handlers.insert(CommandKind::EnableSharding, ddl::enable_sharding);
        handlers.insert(CommandKind::MovePrimary, ddl::move_primary);
        handlers.insert(CommandKind::ShardCollection, ddl::shard_collection);
        handlers.insert(CommandKind::CreateCollection, ddl::create_collection);
        handlers.insert(CommandKind::CollMod, ddl::coll_mod);
        handlers.insert(CommandKind::DropCollection, ddl::drop_collection);
        handlers.insert(CommandKind::DropDatabase, ddl::drop_database);
        handlers.insert(CommandKind::CollectionStats, ddl::collection_stats);
        handlers.insert(CommandKind::SplitChunk, chunks::split_chunk);
        handlers.insert(CommandKind::MergeChunks, chunks::merge_chunks);
        handlers.insert(CommandKind::MoveChunk, chunks::move_chunk);
        handlers.insert(CommandKind::ReshardCollection, resharding::reshard_collection);
        Arc::new(Self {
            catalog,
            rpc,
            authz,
            handlers,
            operations: OperationRegistry::new(MAX_TRACKED_OPERATIONS),
            ddl_lock: Mutex::new(()),
            metrics: ControlMetrics::default(),
        })
    }

    pub fn catalog(&self) -> &Arc<ShardCatalog> {
        &self.catalog
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            commands: self.metrics.commands.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            running_operations: self.operations.running().len(),
        }
    }

    fn authorize(&self, principal: &Principal, cmd: &ClusterCommand) -> KestrelResult<Handler> {
        if let Err(e) = self
            .authz
            .check(principal, Action::ClusterManage, &cmd.resource())
        {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.handlers.get(&cmd.kind()).copied().ok_or_else(|| {
            KestrelError::internal_bug(
                "E-CTL-001",
                "no handler registered",
                cmd.kind().name(),
            )
        })
    }

    /// Run `cmd` to completion on the calling thread.
    pub fn run(&self, principal: &Principal, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
        let handler = self.authorize(principal, &cmd)?;
        let kind = cmd.kind();
        let op = kind
            .is_long_running()
            .then(|| self.operations.begin(kind, cmd.describe()));
        let result = self.execute(handler, cmd);
        if let Some(id) = op {
            self.operations.finish(id, &result);
        }
        result
    }

    /// Start a long-running command on a background thread; poll it with
    /// `GetOperationStatus`.
    pub fn submit(
        self: &Arc<Self>,
        principal: &Principal,
        cmd: ClusterCommand,
    ) -> KestrelResult<OperationId> {
        let handler = self.authorize(principal, &cmd)?;
        let kind = cmd.kind();
        if !kind.is_long_running() {
            return Err(KestrelError::BadValue(format!(
                "{kind} completes synchronously; use run"
            )));
        }
        let id = self.operations.begin(kind, cmd.describe());
        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("kestrel-op-{id}"))
            .spawn(move || {
                let result = this.execute(handler, cmd);
                this.operations.finish(id, &result);
            });
        if let Err(e) = spawned {
            let message = format!("spawn operation thread: {e}");
            self.operations
                .finish(id, &Err(KestrelError::Internal(message.clone())));
            return Err(KestrelError::Internal(message));
        }
        Ok(id)
    }

    fn execute(&self, handler: Handler, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
        let kind = cmd.kind();
        let started = Instant::now();
        self.metrics.commands.fetch_add(1, Ordering::Relaxed);
        let result = if kind.is_serialized() {
            let _guard = self.ddl_lock.lock();
            handler(self, cmd)
        } else {
            handler(self, cmd)
        };
        let elapsed = started.elapsed().as_millis() as u64;
        kestrel_observability::record_cluster_command(kind.name(), result.is_ok(), elapsed);
        match &result {
            Ok(_) => tracing::debug!(
                command = kind.name(),
                elapsed_ms = elapsed,
                "cluster command done",
            ),
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(command = kind.name(), error = %e, "cluster command failed");
            }
        }
        result
    }

    // ── Helpers shared by handlers ──

    fn send(&self, shard: ShardId, req: ShardRequest) -> KestrelResult<ShardResponse> {
        self.rpc.shard(shard, req)
    }

    fn shard_ids(&self) -> Vec<ShardId> {
        self.catalog.list_shards().into_iter().map(|s| s.id).collect()
    }

    fn require_database(&self, db: &str) -> KestrelResult<DatabaseEntry> {
        self.catalog
            .get_database(db)
            .ok_or_else(|| ShardingError::DatabaseNotFound(db.to_string()).into())
    }

    /// Send `make(shard)` to every shard in `shards`, stopping at the first error.
    fn broadcast(
        &self,
        shards: &[ShardId],
        make: impl Fn(ShardId) -> ShardRequest,
    ) -> KestrelResult<()> {
        for &shard in shards {
            self.send(shard, make(shard))?.into_ok()?;
        }
        Ok(())
    }

    fn enter_critical(
        &self,
        shards: &[ShardId],
        scope: &CriticalScope,
        reason: &str,
    ) -> KestrelResult<()> {
        self.broadcast(shards, |_| ShardRequest::EnterCriticalSection {
            scope: scope.clone(),
            reason: reason.to_string(),
            block_reads: false,
        })
    }

    /// Best effort: an unreachable shard's section is released when it
    /// next refreshes.
    fn exit_critical(&self, shards: &[ShardId], scope: &CriticalScope) {
        for &shard in shards {
            let req = ShardRequest::ExitCriticalSection {
                scope: scope.clone(),
            };
            if let Err(e) = self.send(shard, req).and_then(ShardResponse::into_ok) {
                tracing::warn!(
                    shard = %shard,
                    scope = ?scope,
                    error = %e,
                    "critical section exit not delivered",
                );
            }
        }
    }

    /// Ask shards to drop cached metadata for `ns`; failures are logged.
    fn refresh_collection_on(&self, shards: &[ShardId], ns: &Namespace) {
        for &shard in shards {
            let req = ShardRequest::RefreshCollection { ns: ns.clone() };
            if let Err(e) = self.send(shard, req).and_then(ShardResponse::into_ok) {
                tracing::debug!(
                    shard = %shard,
                    ns = %ns,
                    error = %e,
                    "metadata refresh not delivered",
                );
            }
        }
    }

    fn refresh_database_on(&self, shards: &[ShardId], db: &str) {
        for &shard in shards {
            let req = ShardRequest::RefreshDatabase { db: db.to_string() };
            if let Err(e) = self.send(shard, req).and_then(ShardResponse::into_ok) {
                tracing::debug!(shard = %shard, db, error = %e, "database refresh not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_running_kinds() {
        assert!(CommandKind::MoveChunk.is_long_running());
        assert!(CommandKind::ReshardCollection.is_long_running());
        assert!(CommandKind::RemoveShard.is_long_running());
        assert!(!CommandKind::SplitChunk.is_long_running());
        assert!(!CommandKind::MoveChunk.is_serialized());
        assert!(CommandKind::ShardCollection.is_serialized());
    }

    #[test]
    fn test_command_resources() {
        let ns = Namespace::new("app", "users");
        let cmd = ClusterCommand::DropCollection { ns: ns.clone() };
        assert_eq!(cmd.kind(), CommandKind::DropCollection);
        assert_eq!(
            cmd.resource(),
            Resource::Collection {
                db: "app".into(),
                coll: "users".into()
            }
        );
        assert_eq!(
            ClusterCommand::DropDatabase { db: "app".into() }.resource(),
            Resource::Database("app".into())
        );
        assert_eq!(ClusterCommand::ListShards.resource(), Resource::Cluster);
    }
}
