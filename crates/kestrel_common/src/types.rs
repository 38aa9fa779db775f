use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a shard (one replica set holding a partition of the data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

/// Identifier of a replica-set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Fully qualified collection name (`db.coll`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.coll`. The collection part may itself contain dots.
    pub fn parse(full: &str) -> Option<Self> {
        let (db, coll) = full.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }

    /// Namespace used for database-level oplog entries (e.g. `dropDatabase`).
    pub fn database_command(db: impl Into<String>) -> Self {
        Self::new(db, "$cmd")
    }

    pub fn is_command(&self) -> bool {
        self.coll == "$cmd"
    }

    /// Internal bookkeeping namespaces never produce change events.
    pub fn is_internal(&self) -> bool {
        self.db == "config" || self.db == "admin" || self.db == "local"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Lamport-style cluster time: `(seconds, counter)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LogicalTimestamp {
    pub secs: u32,
    pub counter: u32,
}

impl LogicalTimestamp {
    pub const MIN: LogicalTimestamp = LogicalTimestamp { secs: 0, counter: 0 };
    pub const MAX: LogicalTimestamp = LogicalTimestamp {
        secs: u32::MAX,
        counter: u32::MAX,
    };

    pub const fn new(secs: u32, counter: u32) -> Self {
        Self { secs, counter }
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(self) -> Self {
        if self.counter == u32::MAX {
            Self::new(self.secs.saturating_add(1), 0)
        } else {
            Self::new(self.secs, self.counter + 1)
        }
    }

    /// The largest timestamp strictly smaller than `self` (saturating at MIN).
    pub fn prev(self) -> Self {
        if self.counter > 0 {
            Self::new(self.secs, self.counter - 1)
        } else if self.secs > 0 {
            Self::new(self.secs - 1, u32::MAX)
        } else {
            Self::MIN
        }
    }

    pub fn as_u64(self) -> u64 {
        ((self.secs as u64) << 32) | self.counter as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self::new((v >> 32) as u32, v as u32)
    }

    pub fn is_null(self) -> bool {
        self == Self::MIN
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.counter)
    }
}

/// Position of an oplog entry: `(ts, term)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct OpTime {
    pub ts: LogicalTimestamp,
    pub term: u64,
}

impl OpTime {
    pub const fn new(ts: LogicalTimestamp, term: u64) -> Self {
        Self { ts, term }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.ts, self.term)
    }
}

/// Sharding identity of a collection incarnation. Changes only on logical
/// recreation (drop + reshard, `reshardCollection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch(pub Uuid);

impl Epoch {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Version of a chunk or of a shard's placement for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Epoch,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub fn new(epoch: Epoch, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// `(major, minor)` ordering, meaningful only within one epoch.
    pub fn placement(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// True if both versions share an epoch and `self` is strictly older.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        self.same_epoch(other) && self.placement() < other.placement()
    }

    pub fn inc_minor(self) -> Self {
        Self::new(self.epoch, self.major, self.minor + 1)
    }

    pub fn inc_major(self) -> Self {
        Self::new(self.epoch, self.major + 1, 0)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Version of a database's primary-shard assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub uuid: Uuid,
    pub last_mod: u32,
}

impl DatabaseVersion {
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            last_mod: 1,
        }
    }

    pub fn bump(self) -> Self {
        Self {
            uuid: self.uuid,
            last_mod: self.last_mod + 1,
        }
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", &self.uuid.to_string()[..8], self.last_mod)
    }
}

/// Identity of one incarnation of a collection on a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionUuid(pub Uuid);

impl CollectionUuid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lsid(pub Uuid);

impl Lsid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Lsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TxnNumber(pub i64);

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statement id within a retryable write or transaction.
pub type StmtId = i32;

/// Session + transaction number pair identifying a transaction or retryable batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnKey {
    pub lsid: Lsid,
    pub txn_number: TxnNumber,
}

impl TxnKey {
    pub fn new(lsid: Lsid, txn_number: TxnNumber) -> Self {
        Self { lsid, txn_number }
    }
}

impl fmt::Display for TxnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lsid, self.txn_number)
    }
}

/// Write acknowledgement requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteConcern {
    /// Acknowledged once applied on the primary.
    One,
    /// Acknowledged once applied by a majority of the replica set.
    #[default]
    Majority,
}
