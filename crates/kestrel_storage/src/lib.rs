//! # Kestrel storage node
//!
//! In-memory, multi-version document store used by every replica-set member.
//! It provides exactly what the replication and sharding layers consume:
//! timestamped `get/put/delete`, point-in-time snapshot reads, a bounded
//! history window, rollback truncation and a pre-image store.

pub mod mvcc;
pub mod node;

pub use node::{
    require_collection, CollectionInfo, CollectionOptions, ReadHandle, StorageNode,
    StorageSnapshot,
};
