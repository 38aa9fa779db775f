//! Change streams.
//!
//! Each shard translates its majority-committed oplog into change events
//! ([`shard_reader`]); a [`ChangeStreamCursor`] on the router merges the
//! per-shard streams by resume token and only emits an event once every
//! shard has reported a high-water mark at or past it.

pub mod cursor;
pub mod event;
pub mod resume_token;
pub mod shard_reader;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use kestrel_common::pipeline::Pipeline;
use kestrel_common::{LogicalTimestamp, Namespace};

pub use cursor::{ChangeBatch, ChangeStreamCursor};
pub use event::{ChangeEvent, OperationType, UpdateDescription};
pub use resume_token::{ResumeToken, TokenKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullDocumentMode {
    #[default]
    Default,
    /// Updates carry the document's current version.
    UpdateLookup,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreImageMode {
    #[default]
    Off,
    WhenAvailable,
    Required,
}

/// Filter the shards evaluate before looking up pre-images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Empty means every operation type.
    pub op_types: BTreeSet<OperationType>,
    /// Empty means every namespace the target covers.
    pub namespaces: BTreeSet<Namespace>,
}

impl EventFilter {
    pub fn op_types(types: impl IntoIterator<Item = OperationType>) -> Self {
        Self {
            op_types: types.into_iter().collect(),
            namespaces: BTreeSet::new(),
        }
    }

    pub fn matches(&self, op: OperationType, ns: &Namespace) -> bool {
        // Invalidate ends the stream and always passes.
        if op == OperationType::Invalidate {
            return true;
        }
        (self.op_types.is_empty() || self.op_types.contains(&op))
            && (self.namespaces.is_empty() || self.namespaces.contains(ns))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchTarget {
    Collection(Namespace),
    Database(String),
    Cluster,
}

impl WatchTarget {
    pub fn matches_ns(&self, ns: &Namespace) -> bool {
        if ns.is_internal() {
            return false;
        }
        match self {
            WatchTarget::Collection(target) => target == ns,
            WatchTarget::Database(db) => &ns.db == db,
            WatchTarget::Cluster => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchTarget::Collection(_) => "collection",
            WatchTarget::Database(_) => "database",
            WatchTarget::Cluster => "cluster",
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchTarget::Collection(ns) => write!(f, "{ns}"),
            WatchTarget::Database(db) => write!(f, "{db}.*"),
            WatchTarget::Cluster => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    pub resume_after: Option<ResumeToken>,
    /// Like `resume_after`, but may name an invalidate.
    pub start_after: Option<ResumeToken>,
    pub start_at_operation_time: Option<LogicalTimestamp>,
    pub full_document: FullDocumentMode,
    pub full_document_before_change: PreImageMode,
    pub filter: EventFilter,
    pub pipeline: Pipeline,
    /// Events per batch; 0 means unlimited.
    pub batch_size: usize,
}

/// One shard's part of a change stream fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStreamRequest {
    pub target: WatchTarget,
    /// Events strictly after this token are returned.
    pub after: ResumeToken,
    pub limit: usize,
    pub full_document: FullDocumentMode,
    pub before_change: PreImageMode,
    pub filter: EventFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardChangeBatch {
    pub events: Vec<ChangeEvent>,
    /// No event at or before this time remains undiscovered on the shard.
    pub high_water: LogicalTimestamp,
}
