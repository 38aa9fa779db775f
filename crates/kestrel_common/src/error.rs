use thiserror::Error;

use crate::types::{
    ChunkVersion, DatabaseVersion, LogicalTimestamp, NodeId, OpTime, ShardId, TxnKey,
};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input, unknown namespace, permission denied
/// - `Stale`       — routing metadata is outdated; router refreshes and retries
/// - `Retryable`   — conflict, leader change, unreachable node; caller SHOULD retry
/// - `Transient`   — timeout, aged-out snapshot; caller MAY retry after back-off
/// - `Fatal`       — operation abandoned (retries exhausted, history lost)
/// - `InternalBug` — should never happen; triggers alert + diagnostic log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Stale,
    Retryable,
    Transient,
    Fatal,
    InternalBug,
}

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Replication error: {0}")]
    Repl(#[from] ReplError),

    #[error("Sharding error: {0}")]
    Sharding(#[from] ShardingError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Change stream error: {0}")]
    ChangeStream(#[from] ChangeStreamError),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Performing an update on the path '{0}' would modify an immutable field")]
    ImmutableField(String),

    #[error("Duplicate key in {ns}: {key}")]
    DuplicateKey { ns: String, key: String },

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Unauthorized: {principal} may not {action} on {resource}")]
    Unauthorized {
        principal: String,
        action: String,
        resource: String,
    },

    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error talking to {target}: {reason}")]
    Network { target: String, reason: String },

    #[error("Deadline exceeded: {0}")]
    ExceededTimeLimit(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Retryable error with an optional back-off hint.
    #[error("Retryable: {reason}")]
    Retryable { reason: String, retry_after_ms: u64 },

    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    /// Internal bug: always carries a unique `error_code` and `debug_context`.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Storage node errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Snapshot at {requested} unavailable; oldest retained timestamp is {oldest}")]
    SnapshotUnavailable {
        requested: LogicalTimestamp,
        oldest: LogicalTimestamp,
    },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Write at {attempted} is older than the latest version at {latest}")]
    WriteBehindLatest {
        attempted: LogicalTimestamp,
        latest: LogicalTimestamp,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Replication and consensus errors.
#[derive(Error, Debug)]
pub enum ReplError {
    #[error("{node} is not writable primary (term {term})")]
    NotWritablePrimary { node: NodeId, term: u64 },

    #[error("No primary available for {0}")]
    NoPrimary(String),

    #[error("Node {0} is down")]
    NodeDown(NodeId),

    #[error("Node {0} is in rollback")]
    RollbackInProgress(NodeId),

    #[error("Waiting for write concern timed out at {optime} (majority point {majority})")]
    WriteConcernTimeout { optime: OpTime, majority: OpTime },

    #[error("Oplog append out of order: last {last}, attempted {attempted}")]
    OplogOutOfOrder {
        last: LogicalTimestamp,
        attempted: LogicalTimestamp,
    },

    #[error("Election for term {term} failed: {votes}/{needed} votes")]
    ElectionFailed { term: u64, votes: usize, needed: usize },

    #[error("Oplog batch corrupt: {0}")]
    Corrupt(String),

    #[error("Cannot roll back {node}: no common point with sync source")]
    NoCommonPoint { node: NodeId },
}

/// Routing, catalog and migration errors.
#[derive(Error, Debug)]
pub enum ShardingError {
    #[error("StaleConfig for {ns} on {shard}: received {received:?}, wanted {wanted:?}")]
    StaleConfig {
        ns: String,
        shard: ShardId,
        received: Option<ChunkVersion>,
        wanted: Option<ChunkVersion>,
    },

    #[error("StaleDbVersion for {db}: received {received:?}, wanted {wanted:?}")]
    StaleDbVersion {
        db: String,
        received: Option<DatabaseVersion>,
        wanted: Option<DatabaseVersion>,
    },

    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("Shard already exists: {0}")]
    ShardExists(ShardId),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Collection {0} is not sharded")]
    NotSharded(String),

    #[error("Collection {0} is already sharded")]
    AlreadySharded(String),

    #[error("Invalid chunk operation: {0}")]
    InvalidChunkOperation(String),

    #[error("Chunk partition violated for {ns}: {detail}")]
    PartitionViolation { ns: String, detail: String },

    #[error("Routing for {ns} failed after {attempts} attempts: {last}")]
    RoutingRetriesExhausted {
        ns: String,
        attempts: u32,
        last: String,
    },

    #[error("Migration {id} aborted: {reason}")]
    MigrationAborted { id: String, reason: String },

    #[error("Writes to {ns} are blocked by a critical section")]
    CriticalSectionTimeout { ns: String },

    #[error("Shard {0} is draining")]
    ShardDraining(ShardId),

    #[error("Feature compatibility version: {0}")]
    FcvIncompatible(String),

    #[error("Conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("Operation {0} not found")]
    OperationNotFound(u64),
}

/// Transaction errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Write conflict in {ns} on {key}")]
    WriteConflict { ns: String, key: String },

    #[error("No such transaction {0}")]
    NoSuchTransaction(TxnKey),

    #[error("Transaction number {requested} is older than {current} for session")]
    TransactionTooOld { requested: i64, current: i64 },

    #[error("Read of {key} in {ns} conflicts with a prepared transaction")]
    PrepareConflict { ns: String, key: String },

    #[error("Transaction {0} was aborted by its coordinator")]
    AbortedByCoordinator(TxnKey),

    #[error("Transaction {0} already committed")]
    AlreadyCommitted(TxnKey),

    #[error("Transaction {key} is {state}; cannot {op}")]
    InvalidState {
        key: TxnKey,
        state: String,
        op: String,
    },

    #[error("Transaction {0} expired")]
    Expired(TxnKey),
}

/// Change stream errors.
#[derive(Error, Debug)]
pub enum ChangeStreamError {
    #[error("Resume point {requested} is no longer in the oplog (oldest {oldest})")]
    HistoryLost {
        requested: LogicalTimestamp,
        oldest: LogicalTimestamp,
    },

    #[error("Invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("fullDocumentBeforeChange is required but pre-images are disabled for {0}")]
    PreImagesRequired(String),

    #[error("Pre-image for {doc} in {ns} at {ts} is unavailable")]
    PreImageMissing {
        ns: String,
        doc: String,
        ts: LogicalTimestamp,
    },

    #[error("Change stream was invalidated")]
    Invalidated,

    #[error("Change stream fatal error: {0}")]
    Fatal(String),
}

// ── KestrelError classification & helpers ──

impl KestrelError {
    pub fn kind(&self) -> ErrorKind {
        use ChangeStreamError as C;
        use KestrelError as E;
        use ReplError as R;
        use ShardingError as S;
        use StorageError as St;
        match self {
            E::BadValue(_)
            | E::ImmutableField(_)
            | E::DuplicateKey { .. }
            | E::NamespaceNotFound(_)
            | E::Unauthorized { .. }
            | E::IllegalOperation(_)
            | E::Config(_) => ErrorKind::UserError,
            E::Storage(St::CollectionNotFound(_) | St::CollectionExists(_)) => {
                ErrorKind::UserError
            }
            E::Sharding(
                S::ShardNotFound(_)
                | S::ShardExists(_)
                | S::DatabaseNotFound(_)
                | S::NotSharded(_)
                | S::AlreadySharded(_)
                | S::InvalidChunkOperation(_)
                | S::ShardDraining(_)
                | S::FcvIncompatible(_)
                | S::ConflictingOperationInProgress(_)
                | S::OperationNotFound(_),
            ) => ErrorKind::UserError,
            E::Txn(TxnError::InvalidState { .. } | TxnError::AlreadyCommitted(_)) => {
                ErrorKind::UserError
            }
            E::Txn(TxnError::TransactionTooOld { .. }) => ErrorKind::UserError,
            E::ChangeStream(C::InvalidResumeToken(_) | C::PreImagesRequired(_)) => {
                ErrorKind::UserError
            }

            E::Sharding(
                S::StaleConfig { .. } | S::StaleDbVersion { .. } | S::CriticalSectionTimeout { .. },
            ) => ErrorKind::Stale,

            E::Retryable { .. }
            | E::Network { .. }
            | E::Repl(
                R::NotWritablePrimary { .. }
                | R::NoPrimary(_)
                | R::NodeDown(_)
                | R::RollbackInProgress(_)
                | R::WriteConcernTimeout { .. }
                | R::ElectionFailed { .. },
            )
            | E::Txn(
                TxnError::WriteConflict { .. }
                | TxnError::PrepareConflict { .. }
                | TxnError::AbortedByCoordinator(_)
                | TxnError::NoSuchTransaction(_)
                | TxnError::Expired(_),
            )
            | E::Sharding(S::MigrationAborted { .. }) => ErrorKind::Retryable,

            E::Transient { .. }
            | E::ExceededTimeLimit(_)
            | E::Storage(St::SnapshotUnavailable { .. }) => ErrorKind::Transient,

            E::Sharding(S::RoutingRetriesExhausted { .. } | S::PartitionViolation { .. })
            | E::ChangeStream(
                C::HistoryLost { .. } | C::PreImageMissing { .. } | C::Fatal(_) | C::Invalidated,
            )
            | E::Repl(R::Corrupt(_) | R::NoCommonPoint { .. }) => ErrorKind::Fatal,

            E::InternalBug { .. }
            | E::Internal(_)
            | E::Repl(R::OplogOutOfOrder { .. })
            | E::Storage(St::WriteBehindLatest { .. } | St::Serialization(_)) => {
                ErrorKind::InternalBug
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.kind(), ErrorKind::Stale)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::InternalBug)
    }

    /// Failures caused by topology rather than the request itself: the target
    /// was unreachable, not primary, or did not answer in time.
    pub fn is_network_like(&self) -> bool {
        matches!(
            self,
            KestrelError::Network { .. }
                | KestrelError::ExceededTimeLimit(_)
                | KestrelError::Repl(
                    ReplError::NotWritablePrimary { .. }
                        | ReplError::NoPrimary(_)
                        | ReplError::NodeDown(_)
                        | ReplError::RollbackInProgress(_)
                )
        )
    }

    /// Errors after which the client must retry the whole transaction.
    pub fn has_transient_transaction_label(&self) -> bool {
        matches!(
            self,
            KestrelError::Txn(
                TxnError::WriteConflict { .. }
                    | TxnError::PrepareConflict { .. }
                    | TxnError::AbortedByCoordinator(_)
                    | TxnError::NoSuchTransaction(_)
                    | TxnError::Expired(_)
            ) | KestrelError::Repl(ReplError::NotWritablePrimary { .. } | ReplError::NoPrimary(_))
                | KestrelError::Network { .. }
                | KestrelError::Sharding(ShardingError::StaleConfig { .. })
        )
    }

    /// Suggested retry delay in milliseconds (0 = retry immediately).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            KestrelError::Retryable { retry_after_ms, .. } => *retry_after_ms,
            KestrelError::Transient { retry_after_ms, .. } => *retry_after_ms,
            KestrelError::Repl(ReplError::NoPrimary(_)) => 50,
            KestrelError::Repl(ReplError::RollbackInProgress(_)) => 100,
            KestrelError::Sharding(ShardingError::CriticalSectionTimeout { .. }) => 10,
            KestrelError::Network { .. } => 20,
            _ => 0,
        }
    }

    /// Stable numeric code carried on the wire.
    pub fn code(&self) -> i32 {
        use KestrelError as E;
        match self {
            E::Sharding(ShardingError::StaleConfig { .. }) => 13388,
            E::Sharding(ShardingError::StaleDbVersion { .. }) => 249,
            E::Sharding(ShardingError::CriticalSectionTimeout { .. }) => 13388,
            E::Sharding(ShardingError::ShardNotFound(_)) => 70,
            E::Sharding(ShardingError::ShardExists(_)) => 68,
            E::Sharding(ShardingError::DatabaseNotFound(_)) => 26,
            E::Sharding(ShardingError::NotSharded(_)) => 118,
            E::Sharding(ShardingError::AlreadySharded(_)) => 23,
            E::Sharding(ShardingError::InvalidChunkOperation(_)) => 72,
            E::Sharding(ShardingError::PartitionViolation { .. }) => 1,
            E::Sharding(ShardingError::RoutingRetriesExhausted { .. }) => 13388,
            E::Sharding(ShardingError::MigrationAborted { .. }) => 96,
            E::Sharding(ShardingError::ShardDraining(_)) => 117,
            E::Sharding(ShardingError::FcvIncompatible(_)) => 62,
            E::Sharding(ShardingError::ConflictingOperationInProgress(_)) => 117,
            E::Sharding(ShardingError::OperationNotFound(_)) => 211,
            E::Txn(TxnError::WriteConflict { .. }) => 112,
            E::Txn(TxnError::NoSuchTransaction(_)) => 251,
            E::Txn(TxnError::TransactionTooOld { .. }) => 225,
            E::Txn(TxnError::PrepareConflict { .. }) => 112,
            E::Txn(TxnError::AbortedByCoordinator(_)) => 251,
            E::Txn(TxnError::AlreadyCommitted(_)) => 256,
            E::Txn(TxnError::InvalidState { .. }) => 263,
            E::Txn(TxnError::Expired(_)) => 290,
            E::Repl(ReplError::NotWritablePrimary { .. }) => 10107,
            E::Repl(ReplError::NoPrimary(_)) => 133,
            E::Repl(ReplError::NodeDown(_)) => 6,
            E::Repl(ReplError::RollbackInProgress(_)) => 11602,
            E::Repl(ReplError::WriteConcernTimeout { .. }) => 64,
            E::Repl(ReplError::ElectionFailed { .. }) => 189,
            E::Repl(_) => 1,
            E::Storage(StorageError::SnapshotUnavailable { .. }) => 239,
            E::Storage(StorageError::CollectionNotFound(_)) => 26,
            E::Storage(StorageError::CollectionExists(_)) => 48,
            E::Storage(_) => 1,
            E::ChangeStream(ChangeStreamError::HistoryLost { .. }) => 286,
            E::ChangeStream(ChangeStreamError::InvalidResumeToken(_)) => 260,
            E::ChangeStream(ChangeStreamError::PreImagesRequired(_)) => 280,
            E::ChangeStream(ChangeStreamError::PreImageMissing { .. }) => 280,
            E::ChangeStream(ChangeStreamError::Invalidated) => 280,
            E::ChangeStream(ChangeStreamError::Fatal(_)) => 280,
            E::BadValue(_) => 2,
            E::ImmutableField(_) => 66,
            E::DuplicateKey { .. } => 11000,
            E::NamespaceNotFound(_) => 26,
            E::Unauthorized { .. } => 13,
            E::IllegalOperation(_) => 20,
            E::Config(_) => 72,
            E::Network { .. } => 6,
            E::ExceededTimeLimit(_) => 262,
            E::Retryable { .. } => 91,
            E::Transient { .. } => 91,
            E::Internal(_) | E::InternalBug { .. } => 1,
        }
    }

    pub fn retryable(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        KestrelError::Retryable {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        KestrelError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        KestrelError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    pub fn network(target: impl ToString, reason: impl Into<String>) -> Self {
        KestrelError::Network {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Add context string to an error, **preserving error classification**.
    ///
    /// Structured variants get the context prepended to their message; typed
    /// layer errors are returned unchanged because callers match on them.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            KestrelError::Internal(msg) => KestrelError::Internal(format!("{ctx}: {msg}")),
            KestrelError::Retryable {
                reason,
                retry_after_ms,
            } => KestrelError::Retryable {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            KestrelError::Transient {
                reason,
                retry_after_ms,
            } => KestrelError::Transient {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            KestrelError::InternalBug {
                error_code,
                message,
                debug_context,
            } => KestrelError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
            KestrelError::BadValue(msg) => KestrelError::BadValue(format!("{ctx}: {msg}")),
            KestrelError::IllegalOperation(msg) => {
                KestrelError::IllegalOperation(format!("{ctx}: {msg}"))
            }
            other => other,
        }
    }

    /// Emit a structured log entry for fatal and internal-bug errors.
    pub fn log_if_fatal(&self) {
        match self.kind() {
            ErrorKind::InternalBug => {
                tracing::error!(code = self.code(), error_category = "InternalBug", "{}", self)
            }
            ErrorKind::Fatal => {
                tracing::error!(code = self.code(), error_category = "Fatal", "{}", self)
            }
            _ => {}
        }
    }
}

/// Bail with a retryable error.
/// Usage: `bail_retryable!(50, "primary stepped down on {}", shard)`
#[macro_export]
macro_rules! bail_retryable {
    ($after_ms:expr, $msg:expr) => {
        return Err($crate::error::KestrelError::retryable($msg, $after_ms))
    };
    ($after_ms:expr, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::KestrelError::retryable(format!($fmt, $($arg)*), $after_ms))
    };
}

/// Bail with an illegal-operation error.
#[macro_export]
macro_rules! bail_illegal {
    ($msg:expr) => {
        return Err($crate::error::KestrelError::IllegalOperation($msg.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::KestrelError::IllegalOperation(format!($fmt, $($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Epoch, Lsid, TxnNumber};

    fn stale() -> KestrelError {
        let e = Epoch::generate();
        ShardingError::StaleConfig {
            ns: "db.c".into(),
            shard: ShardId(1),
            received: Some(ChunkVersion::new(e, 1, 0)),
            wanted: Some(ChunkVersion::new(e, 2, 0)),
        }
        .into()
    }

    #[test]
    fn test_stale_config_classification_and_code() {
        let err = stale();
        assert_eq!(err.kind(), ErrorKind::Stale);
        assert!(err.is_stale());
        assert_eq!(err.code(), 13388);
    }

    #[test]
    fn test_write_conflict_has_transient_txn_label() {
        let err: KestrelError = TxnError::WriteConflict {
            ns: "db.c".into(),
            key: "1".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.has_transient_transaction_label());
        assert_eq!(err.code(), 112);
    }

    #[test]
    fn test_no_such_transaction_code() {
        let key = TxnKey::new(Lsid::generate(), TxnNumber(3));
        let err: KestrelError = TxnError::NoSuchTransaction(key).into();
        assert_eq!(err.code(), 251);
        assert!(err.has_transient_transaction_label());
    }

    #[test]
    fn test_routing_exhausted_is_fatal() {
        let err: KestrelError = ShardingError::RoutingRetriesExhausted {
            ns: "db.c".into(),
            attempts: 10,
            last: "stale".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_with_context_preserves_classification() {
        let err = KestrelError::retryable("leader changed", 25).with_context("insert");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), 25);
        assert!(err.to_string().contains("insert: leader changed"));
        let err = stale().with_context("ignored");
        assert!(err.is_stale());
    }

    #[test]
    fn test_network_like_errors() {
        assert!(KestrelError::network(ShardId(2), "unreachable").is_network_like());
        assert!(KestrelError::Repl(ReplError::NodeDown(NodeId(1))).is_network_like());
        assert!(!stale().is_network_like());
    }

    #[test]
    fn test_history_lost_code() {
        let err: KestrelError = ChangeStreamError::HistoryLost {
            requested: LogicalTimestamp::new(1, 0),
            oldest: LogicalTimestamp::new(5, 0),
        }
        .into();
        assert_eq!(err.code(), 286);
        assert!(err.is_fatal());
    }
}
