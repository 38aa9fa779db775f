mod common;

use std::sync::Arc;

use kestrel_cluster::fault_injection::{MIGRATION_CRASH_AFTER_COMMIT, MIGRATION_FAIL_AFTER_CLONE};
use kestrel_cluster::RemoveShardStatus;
use kestrel_common::error::ShardingError;

use common::*;

/// Sharded on `k`, split at 50, all 100 documents still on shard 1.
fn loaded(cluster: &KestrelCluster) -> Namespace {
    let ns = users();
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
    cluster.router("loader").insert(&ns, docs(0..100)).unwrap();
    ns
}

fn owner_of(cluster: &KestrelCluster, ns: &Namespace, k: i64) -> ShardId {
    cluster
        .catalog()
        .get_collection(ns)
        .unwrap()
        .chunks
        .owner(&key(k))
        .unwrap()
}

fn move_upper(cluster: &KestrelCluster, ns: &Namespace) -> Result<CommandReply, KestrelError> {
    cluster.admin(ClusterCommand::MoveChunk {
        ns: ns.clone(),
        range: upper_from(50),
        to: ShardId(2),
    })
}

#[test]
fn test_move_chunk_clones_and_cleans_up() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);

    let CommandReply::Migrated(outcome) = move_upper(&cluster, &ns).unwrap() else {
        panic!("expected a migration outcome");
    };
    assert_eq!(outcome.docs_cloned, 50);
    assert_eq!(owner_of(&cluster, &ns, 75), ShardId(2));
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 50);
    // The donor keeps its copies until the range deleter runs.
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 100);
    assert_eq!(cluster.router("r1").count(&ns, &Filter::all()).unwrap(), 100);

    let report = cluster.run_maintenance();
    assert_eq!(report.orphans_deleted, 50);
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 50);
    assert_eq!(cluster.router("r2").count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_writes_after_move_reach_new_owner() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    let router = cluster.router("r1");
    move_upper(&cluster, &ns).unwrap();

    router.insert(&ns, vec![doc(150)]).unwrap();
    let set = UpdateSpec::parse(&serde_json::json!({"$set": {"v": 7}})).unwrap();
    router.update(&ns, Filter::eq("k", serde_json::json!(60)), set, false, false).unwrap();

    let found = router.find_one(&ns, &Filter::eq("k", serde_json::json!(60))).unwrap().unwrap();
    assert_eq!(found.get("v"), Some(&serde_json::json!(7)));
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 101);
}

#[test]
fn test_failure_after_clone_aborts_and_retry_succeeds() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    cluster.failpoints().enable_times(MIGRATION_FAIL_AFTER_CLONE, 1);

    let err = move_upper(&cluster, &ns).unwrap_err();
    assert!(
        matches!(err, KestrelError::Sharding(ShardingError::MigrationAborted { .. })),
        "{err}"
    );
    assert_eq!(owner_of(&cluster, &ns, 75), ShardId(1));
    assert_eq!(cluster.router("r1").count(&ns, &Filter::all()).unwrap(), 100);

    let CommandReply::Migrated(outcome) = move_upper(&cluster, &ns).unwrap() else {
        panic!("expected a migration outcome");
    };
    assert_eq!(outcome.docs_cloned, 50);
    assert_eq!(owner_of(&cluster, &ns, 75), ShardId(2));
    assert_eq!(cluster.router("r2").count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_donor_crash_after_commit_recovers() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    cluster.failpoints().enable_times(MIGRATION_CRASH_AFTER_COMMIT, 1);

    let err = move_upper(&cluster, &ns).unwrap_err();
    assert!(err.is_network_like(), "{err}");
    // The decision was already durable in the catalog.
    assert_eq!(owner_of(&cluster, &ns, 75), ShardId(2));

    let report = cluster.run_maintenance();
    assert_eq!(report.migrations_recovered, 1);
    assert_eq!(report.orphans_deleted, 50);
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 50);
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 50);
    assert_eq!(cluster.router("r1").count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_inserts_during_move_are_neither_lost_nor_duplicated() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);

    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            let router = cluster.router("writer");
            for i in 0..100 {
                // Keys inside the moving range, ids clear of the preload.
                let d = serde_json::json!({"_id": 1000 + i, "k": 50 + i % 50, "v": 0});
                router.insert(&ns, vec![d.as_object().cloned().unwrap()]).unwrap();
            }
        });
        move_upper(&cluster, &ns).unwrap();
        writer.join().unwrap();
    });

    let router = cluster.router("r1");
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 200);
    cluster.run_maintenance();
    let all = router.find(&ns, &Filter::all()).unwrap();
    let ids: std::collections::BTreeSet<String> =
        all.iter().map(|d| d.get("_id").unwrap().to_string()).collect();
    assert_eq!(all.len(), 200);
    assert_eq!(ids.len(), 200);
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 50);
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 150);
}

#[test]
fn test_move_to_same_shard_rejected() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    let err = cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(50),
            to: ShardId(1),
        })
        .unwrap_err();
    assert!(
        matches!(err, KestrelError::Sharding(ShardingError::InvalidChunkOperation(_))),
        "{err}"
    );
}

#[test]
fn test_merge_after_move_back() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    move_upper(&cluster, &ns).unwrap();
    let err = cluster
        .admin(ClusterCommand::MergeChunks {
            ns: ns.clone(),
            range: ns_full(),
        })
        .unwrap_err();
    assert!(
        matches!(err, KestrelError::Sharding(ShardingError::InvalidChunkOperation(_))),
        "{err}"
    );

    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(50),
            to: ShardId(1),
        })
        .unwrap();
    let reply = cluster
        .admin(ClusterCommand::MergeChunks {
            ns: ns.clone(),
            range: ns_full(),
        })
        .unwrap();
    assert!(matches!(reply, CommandReply::Merged(_)));
    assert_eq!(cluster.catalog().get_collection(&ns).unwrap().chunks.len(), 1);
}

fn ns_full() -> KeyRange {
    KeyRange::new(ShardKey::global_min(1), ShardKey::global_max(1))
}

fn balancing_cluster(auto_split: bool) -> Arc<KestrelCluster> {
    let mut config = KestrelConfig::for_tests();
    config.cluster.shards = 2;
    config.balancer.enabled = true;
    config.balancer.auto_split = auto_split;
    config.balancer.max_chunk_size_bytes = 512;
    cluster_with(config)
}

#[test]
fn test_balancer_spreads_chunks() {
    let cluster = balancing_cluster(true);
    let ns = loaded(&cluster);

    let mut moved = 0;
    for round in 0..40 {
        let report = cluster.balancer().run_round().unwrap();
        assert_eq!(report.failed, 0);
        moved += report.migrations;
        if round > 0 && report.splits == 0 && report.migrations == 0 {
            break;
        }
    }
    assert!(moved > 0);
    let routing = cluster.catalog().get_collection(&ns).unwrap();
    assert!(!routing.chunks.chunks_on(ShardId(1)).is_empty());
    assert!(!routing.chunks.chunks_on(ShardId(2)).is_empty());

    cluster.run_maintenance();
    let on_one = stored_on(&cluster, ShardId(1), &ns);
    let on_two = stored_on(&cluster, ShardId(2), &ns);
    assert_eq!(on_one + on_two, 100);
    assert!(on_two > 0);
    assert_eq!(cluster.router("r1").count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_disabled_balancer_does_nothing() {
    let cluster = cluster(2);
    let ns = loaded(&cluster);
    let report = cluster.balancer().run_round().unwrap();
    assert_eq!(report.migrations + report.splits, 0);
    assert!(cluster.catalog().get_collection(&ns).unwrap().chunks.chunks_on(ShardId(2)).is_empty());
}

#[test]
fn test_remove_shard_drains_through_balancer() {
    let cluster = balancing_cluster(false);
    let ns = users();
    sharded_split(&cluster, &ns);
    cluster.router("loader").insert(&ns, docs(0..100)).unwrap();

    let remove = || match cluster
        .admin(ClusterCommand::RemoveShard { shard: ShardId(2) })
        .unwrap()
    {
        CommandReply::RemoveShard(status) => status,
        other => panic!("unexpected reply {other:?}"),
    };
    assert!(matches!(remove(), RemoveShardStatus::Started));
    assert!(matches!(remove(), RemoveShardStatus::Ongoing { chunks: 1, .. }));

    let report = cluster.balancer().run_round().unwrap();
    assert_eq!(report.migrations, 1);
    assert!(matches!(remove(), RemoveShardStatus::Completed));

    let listed: Vec<ShardId> = cluster.catalog().list_shards().iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![ShardId(1)]);
    assert_eq!(cluster.router("r1").count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_cannot_remove_last_shard() {
    let cluster = cluster(1);
    let err = cluster
        .admin(ClusterCommand::RemoveShard { shard: ShardId(1) })
        .unwrap_err();
    assert!(matches!(err, KestrelError::IllegalOperation(_)), "{err}");
}
