//! Cross-shard transactions.
//!
//! Each shard runs a [`crate::shard::TxnParticipant`] for its part of a
//! transaction. A transaction that wrote to more than one shard commits
//! through two-phase commit driven by a [`TxnCoordinator`] on the first
//! shard it touched.

pub mod coordinator;

use serde::{Deserialize, Serialize};

use kestrel_common::LogicalTimestamp;

pub use coordinator::{CoordinatorDocument, CoordinatorSnapshot, TxnCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitDecision {
    Commit { commit_ts: LogicalTimestamp },
    Abort,
}

impl CommitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitDecision::Commit { .. } => "commit",
            CommitDecision::Abort => "abort",
        }
    }
}
