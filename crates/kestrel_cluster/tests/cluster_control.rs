mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use kestrel_cluster::{
    FcvState, FeatureVersion, OperationState, OperationType, WatchTarget,
};
use kestrel_common::authz::{Action, Principal, StaticAuthz};
use kestrel_common::error::ShardingError;

use common::*;

fn regional(k: i64) -> Document {
    json!({"_id": k, "k": k, "region": k % 4, "v": 0})
        .as_object()
        .cloned()
        .unwrap()
}

fn shard_by(
    cluster: &KestrelCluster,
    ns: &Namespace,
    key: ShardKeyPattern,
) -> Result<CommandReply, KestrelError> {
    cluster.admin(ClusterCommand::ShardCollection {
        ns: ns.clone(),
        key,
        unique: false,
        presplit_chunks_per_shard: None,
    })
}

#[test]
fn test_shard_collection_is_idempotent_for_same_key() {
    let cluster = cluster(2);
    let ns = users();
    let first = shard_by(&cluster, &ns, ShardKeyPattern::ranged(&["k"])).unwrap();
    let again = shard_by(&cluster, &ns, ShardKeyPattern::ranged(&["k"])).unwrap();
    assert_eq!(first, again);

    let err = shard_by(&cluster, &ns, ShardKeyPattern::ranged(&["v"])).unwrap_err();
    assert!(
        matches!(err, KestrelError::Sharding(ShardingError::AlreadySharded(_))),
        "{err}"
    );
}

#[test]
fn test_hashed_presplit_spreads_inserts() {
    let cluster = cluster(2);
    let ns = users();
    let reply = cluster
        .admin(ClusterCommand::ShardCollection {
            ns: ns.clone(),
            key: ShardKeyPattern::hashed("k"),
            unique: false,
            presplit_chunks_per_shard: Some(2),
        })
        .unwrap();
    assert!(matches!(reply, CommandReply::Collection { chunks: 4, .. }));
    let routing = cluster.catalog().get_collection(&ns).unwrap();
    assert_eq!(routing.chunks.chunks_on(ShardId(1)).len(), 2);
    assert_eq!(routing.chunks.chunks_on(ShardId(2)).len(), 2);

    let router = cluster.router("r1");
    router.insert(&ns, docs(0..100)).unwrap();
    assert!(stored_on(&cluster, ShardId(1), &ns) > 0);
    assert!(stored_on(&cluster, ShardId(2), &ns) > 0);
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 100);
    // Equality on a hashed key still targets a single shard.
    assert_eq!(router.route(&ns, &Filter::eq("k", json!(42))).unwrap().len(), 1);
}

#[test]
fn test_presplit_needs_hashed_key() {
    let cluster = cluster(2);
    let err = cluster
        .admin(ClusterCommand::ShardCollection {
            ns: users(),
            key: ShardKeyPattern::ranged(&["k"]),
            unique: false,
            presplit_chunks_per_shard: Some(2),
        })
        .unwrap_err();
    assert!(matches!(err, KestrelError::BadValue(_)), "{err}");
}

#[test]
fn test_collection_stats_sum_shards() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    cluster.router("r1").insert(&ns, docs(0..100)).unwrap();

    let CommandReply::Stats(stats) = cluster
        .admin(ClusterCommand::CollectionStats { ns: ns.clone() })
        .unwrap()
    else {
        panic!("expected stats");
    };
    assert_eq!(stats.total.docs, 100);
    assert_eq!(stats.total.orphans, 0);
    assert!(stats.total.bytes > 0);
    let per_shard: Vec<(ShardId, u64)> =
        stats.per_shard.iter().map(|(s, c)| (*s, c.docs)).collect();
    assert_eq!(per_shard, vec![(ShardId(1), 50), (ShardId(2), 50)]);
}

#[test]
fn test_drop_collection_and_database() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let notes = Namespace::new("app", "notes");
    let router = cluster.router("r1");
    router.insert(&ns, docs(0..100)).unwrap();
    router.insert(&notes, docs(0..3)).unwrap();

    cluster.admin(ClusterCommand::DropCollection { ns: ns.clone() }).unwrap();
    assert!(cluster.catalog().get_collection(&ns).is_none());
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 0);
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 0);
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 0);
    // Dropping again, or in a database that does not exist, is fine.
    cluster.admin(ClusterCommand::DropCollection { ns: ns.clone() }).unwrap();
    cluster
        .admin(ClusterCommand::DropCollection {
            ns: Namespace::new("nowhere", "nothing"),
        })
        .unwrap();

    cluster.admin(ClusterCommand::DropDatabase { db: "app".into() }).unwrap();
    assert!(cluster.catalog().get_database("app").is_none());
    assert_eq!(stored_on(&cluster, ShardId(1), &notes), 0);
}

#[test]
fn test_set_fcv_gates_resharding() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);

    let reply = cluster
        .admin(ClusterCommand::SetFcv { version: FeatureVersion::V4_4 })
        .unwrap();
    assert_eq!(reply, CommandReply::Fcv(FcvState::Stable(FeatureVersion::V4_4)));
    let err = cluster
        .admin(ClusterCommand::ReshardCollection {
            ns: ns.clone(),
            key: ShardKeyPattern::ranged(&["v"]),
        })
        .unwrap_err();
    assert!(
        matches!(err, KestrelError::Sharding(ShardingError::FcvIncompatible(_))),
        "{err}"
    );

    let reply = cluster
        .admin(ClusterCommand::SetFcv { version: FeatureVersion::LATEST })
        .unwrap();
    assert_eq!(reply, CommandReply::Fcv(FcvState::Stable(FeatureVersion::LATEST)));
}

#[test]
fn test_reshard_keeps_documents_and_announces() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    router.insert(&ns, (0..100).map(regional).collect()).unwrap();
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();

    let new_key = ShardKeyPattern::ranged(&["region"]);
    cluster
        .admin(ClusterCommand::ReshardCollection {
            ns: ns.clone(),
            key: new_key.clone(),
        })
        .unwrap();

    let routing = cluster.catalog().get_collection(&ns).unwrap();
    assert_eq!(routing.entry.key_pattern, new_key);
    assert!(!routing.entry.resharding);
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 100);
    assert_eq!(
        stored_on(&cluster, ShardId(1), &ns) + stored_on(&cluster, ShardId(2), &ns),
        100
    );
    assert_eq!(router.find(&ns, &Filter::eq("region", json!(2))).unwrap().len(), 25);
    assert_eq!(router.route(&ns, &Filter::eq("region", json!(2))).unwrap().len(), 1);

    let events = drain(&mut cursor, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation_type, OperationType::ReshardCollection);
    assert_eq!(events[0].new_shard_key.as_ref(), Some(&new_key));
}

#[test]
fn test_submitted_move_chunk_reports_completion() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    cluster.router("r1").insert(&ns, docs(0..100)).unwrap();

    let id = cluster
        .control()
        .submit(
            &Principal::Internal,
            ClusterCommand::MoveChunk {
                ns: ns.clone(),
                range: upper_from(50),
                to: ShardId(1),
            },
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let CommandReply::Operation(status) = cluster
            .admin(ClusterCommand::GetOperationStatus { id })
            .unwrap()
        else {
            panic!("expected an operation status");
        };
        if status.state != OperationState::Running || Instant::now() > deadline {
            break status;
        }
        std::thread::sleep(Duration::from_millis(5));
    };
    match status.state {
        OperationState::Succeeded(reply) => match *reply {
            CommandReply::Migrated(outcome) => assert_eq!(outcome.docs_cloned, 50),
            other => panic!("unexpected reply {other:?}"),
        },
        other => panic!("unexpected state {other:?}"),
    }
    let owners: BTreeSet<ShardId> = cluster.catalog().get_collection(&ns).unwrap().chunks.shards();
    assert_eq!(owners, BTreeSet::from([ShardId(1)]));
}

#[test]
fn test_short_commands_cannot_be_submitted() {
    let cluster = cluster(2);
    let err = cluster
        .control()
        .submit(&Principal::Internal, ClusterCommand::ListShards)
        .unwrap_err();
    assert!(matches!(err, KestrelError::BadValue(_)), "{err}");
}

#[test]
fn test_unprivileged_user_is_rejected() {
    kestrel_observability::try_init_test_tracing();
    let mut config = KestrelConfig::for_tests();
    config.cluster.shards = 2;
    let authz = StaticAuthz::new().grant_db("reader", "app", &[Action::Find]);
    let cluster = KestrelCluster::builder(config)
        .wall_clock(ManualWallClock::new(100))
        .authz(Arc::new(authz))
        .build()
        .unwrap();
    let ns = users();
    sharded_split(&cluster, &ns);
    cluster.router("admin").insert(&ns, docs(0..10)).unwrap();

    let reader = cluster.router_as("reader", Principal::User("reader".into()));
    assert_eq!(reader.find(&ns, &Filter::all()).unwrap().len(), 10);
    let err = reader.insert(&ns, vec![doc(11)]).unwrap_err();
    assert!(matches!(err, KestrelError::Unauthorized { .. }), "{err}");

    let err = cluster
        .control()
        .run(&Principal::User("reader".into()), ClusterCommand::ListShards)
        .unwrap_err();
    assert!(matches!(err, KestrelError::Unauthorized { .. }), "{err}");
}
