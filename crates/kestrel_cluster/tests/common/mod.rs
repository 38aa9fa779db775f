#![allow(dead_code, unused_imports)]

use std::sync::Arc;

use serde_json::json;

pub use kestrel_cluster::{
    ChangeEvent, ChangeStreamCursor, ChangeStreamOptions, ClusterCommand, CommandReply,
    KestrelCluster, Router,
};
pub use kestrel_common::config::KestrelConfig;
pub use kestrel_common::{
    Document, Filter, KestrelError, KeyRange, KeyValue, ManualWallClock, Namespace, ShardId,
    ShardKey, ShardKeyPattern, UpdateSpec,
};

pub fn cluster_with(config: KestrelConfig) -> Arc<KestrelCluster> {
    kestrel_observability::try_init_test_tracing();
    KestrelCluster::builder(config)
        .wall_clock(ManualWallClock::new(100))
        .build()
        .unwrap()
}

/// A cluster with `shards` three-member shards.
pub fn cluster(shards: usize) -> Arc<KestrelCluster> {
    let mut config = KestrelConfig::for_tests();
    config.cluster.shards = shards;
    cluster_with(config)
}

pub fn users() -> Namespace {
    Namespace::new("app", "users")
}

pub fn doc(k: i64) -> Document {
    json!({"_id": k, "k": k, "v": 0}).as_object().cloned().unwrap()
}

pub fn docs(range: std::ops::Range<i64>) -> Vec<Document> {
    range.map(doc).collect()
}

pub fn key(k: i64) -> ShardKey {
    ShardKey::single(KeyValue::Int(k))
}

/// `[at, MaxKey)` on a single-field key.
pub fn upper_from(at: i64) -> KeyRange {
    KeyRange::new(key(at), ShardKey::global_max(1))
}

/// `[MinKey, at)` on a single-field key.
pub fn lower_to(at: i64) -> KeyRange {
    KeyRange::new(ShardKey::global_min(1), key(at))
}

/// Documents of `ns` physically present on `shard`'s primary, orphans
/// included.
pub fn stored_on(cluster: &KestrelCluster, shard: ShardId, ns: &Namespace) -> usize {
    cluster
        .shard(shard)
        .unwrap()
        .replica_set()
        .primary_storage()
        .unwrap()
        .count_latest(ns)
}

/// Shard `ns` on a ranged `k`, primary on shard 1, split at 50 with the
/// upper half moved to shard 2.
pub fn sharded_split(cluster: &KestrelCluster, ns: &Namespace) {
    cluster
        .admin(ClusterCommand::EnableSharding {
            db: ns.db.clone(),
            primary: Some(ShardId(1)),
        })
        .unwrap();
    cluster
        .admin(ClusterCommand::ShardCollection {
            ns: ns.clone(),
            key: ShardKeyPattern::ranged(&["k"]),
            unique: false,
            presplit_chunks_per_shard: None,
        })
        .unwrap();
    cluster
        .admin(ClusterCommand::SplitChunk {
            ns: ns.clone(),
            at: key(50),
        })
        .unwrap();
    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(50),
            to: ShardId(2),
        })
        .unwrap();
}

/// Poll `cursor` until it has produced `n` events or a bounded number of
/// empty rounds passed.
pub fn drain(cursor: &mut ChangeStreamCursor, n: usize) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    for _ in 0..50 {
        if out.len() >= n || cursor.is_closed() {
            break;
        }
        let batch = cursor.next_batch().unwrap();
        out.extend(batch.events);
    }
    out
}
