//! Chunk migration.
//!
//! A migration is driven by the donor shard. It clones a range to the
//! recipient, replays the donor's oplog until the two are close, blocks
//! writes to the range, drains the last changes, commits ownership on the
//! config server and schedules the donor's copy for deletion. Its progress
//! is persisted on the config server so a donor that fails over can finish
//! or roll back whatever it left behind.

pub mod balancer;
pub mod donor;
pub mod recipient;

use serde::{Deserialize, Serialize};

use kestrel_common::{CollectionUuid, Epoch, KeyRange, LogicalTimestamp, Namespace, ShardId};

pub use balancer::{Balancer, BalancerRoundReport, BalancerSnapshot};
pub use donor::MigrationOutcome;
pub use recipient::{IncomingMigration, MigrationRecipient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Cloning,
    CatchingUp,
    CriticalSection,
    CommitPending,
    Committed,
    Aborted,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Cloning => "cloning",
            MigrationPhase::CatchingUp => "catchingUp",
            MigrationPhase::CriticalSection => "criticalSection",
            MigrationPhase::CommitPending => "commitPending",
            MigrationPhase::Committed => "committed",
            MigrationPhase::Aborted => "aborted",
        }
    }
}

/// Durable record of one in-flight migration, kept in `config.migrations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    pub id: String,
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub epoch: Epoch,
    pub range: KeyRange,
    pub donor: ShardId,
    pub recipient: ShardId,
    pub phase: MigrationPhase,
    /// Newest donor oplog entry already shipped to the recipient.
    pub last_applied_donor_ts: LogicalTimestamp,
    pub started_wall_secs: u32,
}

impl MigrationDocument {
    pub fn id_for(ns: &Namespace, range: &KeyRange) -> String {
        format!("{ns}-{range}")
    }
}
