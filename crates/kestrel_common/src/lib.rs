//! Common building blocks shared by every Kestrel crate: identifiers, the
//! cluster logical clock, the shard-key and document model, the error
//! taxonomy, configuration, and the interfaces Kestrel consumes from the
//! outside world (authorization, pipeline execution).

pub mod authz;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod shard_key;
pub mod shutdown;
pub mod types;

pub use clock::{ClusterClock, ManualWallClock, SystemWallClock, WallClock};
pub use document::{DocKey, Document, UpdateSpec};
pub use error::{ErrorKind, KestrelError, KestrelResult};
pub use filter::{Condition, Filter};
pub use shard_key::{KeyRange, KeyValue, ShardKey, ShardKeyPattern};
pub use types::*;
