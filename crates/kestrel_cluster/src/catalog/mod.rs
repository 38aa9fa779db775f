//! Cluster metadata: chunk maps, the feature compatibility version, the
//! authoritative catalog on the config replica set, and the config server
//! that answers routing and migration-commit requests from other processes.

pub mod chunk_map;
pub mod config_server;
pub mod fcv;
pub mod shard_catalog;

use serde::{Deserialize, Serialize};

use kestrel_common::ChunkVersion;

pub use chunk_map::{Chunk, ChunkMap};
pub use config_server::ConfigServer;
pub use fcv::{FcvState, FeatureVersion};
pub use shard_catalog::{
    CollectionEntry, CollectionRouting, DatabaseEntry, RemoveShardStatus, RoutingUpdate,
    ShardCatalog, ShardEntry,
};

/// Versions produced by committing a chunk move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkVersionPair {
    /// Version of the moved chunk on the recipient.
    pub moved: ChunkVersion,
    /// The donor's shard version afterwards.
    pub donor: ChunkVersion,
}
