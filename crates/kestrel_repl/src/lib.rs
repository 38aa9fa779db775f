//! # Kestrel replication
//!
//! Per-shard replica sets: the oplog, elections with terms and leases,
//! majority commit tracking, secondary application and rollback.

pub mod applier;
pub mod election;
pub mod node;
pub mod oplog;
pub mod replica_set;
pub mod runner;

pub use node::{MemberState, PreparedTxn, ReplicaNode};
pub use oplog::{
    CrudOp, Oplog, OplogBatch, OplogDraft, OplogEntry, OplogOp, StmtOutcome, TxnInfo, TxnOp,
};
pub use replica_set::{MemberStatus, PrimaryWrite, ReplSetSnapshot, ReplicaSet, WriteOutcome};
pub use runner::{ReplicaSetSource, ReplicationRunner, ReplicationRunnerHandle};
