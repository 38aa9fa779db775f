//! # Kestrel cluster
//!
//! Horizontal partitioning on top of `kestrel_repl` replica sets: the shard
//! catalog and config server, shard servers, the query router, chunk
//! migration and the balancer, cross-shard two-phase commit, cluster-wide
//! change streams and the operator command surface.
//!
//! Components only talk through [`transport`]; [`cluster::KestrelCluster`]
//! wires them together in one process.

pub mod catalog;
pub mod change_stream;
pub mod cluster;
pub mod control;
pub(crate) mod durable;
pub mod fault_injection;
pub mod messages;
pub mod migration;
pub mod router;
pub mod runners;
pub mod shard;
pub mod transport;
pub mod txn;

pub use catalog::{
    Chunk, ChunkMap, CollectionEntry, CollectionRouting, DatabaseEntry, FcvState, FeatureVersion,
    RemoveShardStatus, ShardCatalog, ShardEntry,
};
pub use change_stream::{
    ChangeBatch, ChangeEvent, ChangeStreamCursor, ChangeStreamOptions, EventFilter,
    FullDocumentMode, OperationType, PreImageMode, ResumeToken, WatchTarget,
};
pub use cluster::{ClusterBuilder, ClusterMaintenanceReport, ClusterSnapshot, KestrelCluster};
pub use control::{
    ClusterCollectionStats, ClusterCommand, ClusterControl, CommandKind, CommandReply,
    OperationId, OperationState, OperationStatus,
};
pub use fault_injection::{FaultInjector, Failpoints};
pub use messages::{CollectionStats, WriteOp, WriteResult};
pub use migration::{Balancer, BalancerRoundReport, MigrationOutcome};
pub use router::{ClientSession, Router, RouterTransaction, WriteOptions};
pub use runners::{BalancerRunner, RunnerHandle, ShardMaintenanceRunner};
pub use shard::ShardServer;
pub use transport::{Endpoint, InProcessTransport};
pub use txn::CommitDecision;
