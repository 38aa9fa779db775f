//! The shard side of the cluster: filtering metadata, critical sections,
//! retryable-write sessions, transaction participation, orphan cleanup and
//! the request handler tying them together.

pub mod critical_section;
pub(crate) mod crud;
pub mod metadata;
pub mod participant;
pub mod range_deleter;
pub mod server;
pub mod sessions;

pub use critical_section::{CriticalScope, CriticalSections, WriteTarget};
pub use metadata::{CollectionFilter, ShardMetadata};
pub use participant::{ParticipantSnapshot, TxnParticipant, TxnState};
pub use range_deleter::{range_deletions_ns, RangeDeleter, RangeDeletionTask};
pub use server::{MaintenanceReport, ShardServer, ShardServerSnapshot};
pub use sessions::{MigratedSession, SessionCatalog};
