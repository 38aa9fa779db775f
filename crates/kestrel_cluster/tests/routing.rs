mod common;

use std::collections::BTreeSet;

use serde_json::json;

use common::*;

#[test]
fn test_equality_on_shard_key_targets_one_shard() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");

    let low = router.route(&ns, &Filter::eq("k", json!(10))).unwrap();
    assert_eq!(low, BTreeSet::from([ShardId(1)]));
    let high = router.route(&ns, &Filter::eq("k", json!(75))).unwrap();
    assert_eq!(high, BTreeSet::from([ShardId(2)]));
    let all = router.route(&ns, &Filter::all()).unwrap();
    assert_eq!(all, BTreeSet::from([ShardId(1), ShardId(2)]));
}

#[test]
fn test_writes_land_on_owning_shard() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");

    let res = router.insert(&ns, docs(0..100)).unwrap();
    assert_eq!(res.n, 100);
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 50);
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 50);
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 100);

    let found = router.find(&ns, &Filter::eq("k", json!(77))).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("_id"), Some(&json!(77)));
}

#[test]
fn test_multi_update_broadcasts() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    router.insert(&ns, docs(0..100)).unwrap();

    let inc = UpdateSpec::parse(&json!({"$inc": {"v": 1}})).unwrap();
    let res = router.update(&ns, Filter::all(), inc, false, true).unwrap();
    assert_eq!(res.n, 100);
    assert_eq!(router.count(&ns, &Filter::eq("v", json!(1))).unwrap(), 100);
}

#[test]
fn test_single_update_must_target_one_shard() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    router.insert(&ns, docs(0..100)).unwrap();

    let set = UpdateSpec::parse(&json!({"$set": {"v": 9}})).unwrap();
    let err = router.update(&ns, Filter::eq("v", json!(0)), set, false, false).unwrap_err();
    assert!(matches!(err, KestrelError::BadValue(_)), "{err}");
}

#[test]
fn test_missing_shard_key_routes_as_null_and_unusable_key_rejected() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");

    // Null sorts below every integer, so the lower chunk owns it.
    let keyless = json!({"_id": 1, "v": 0}).as_object().cloned().unwrap();
    router.insert(&ns, vec![keyless]).unwrap();
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 1);
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 0);
    let found = router.find(&ns, &Filter::eq("k", json!(null))).unwrap();
    assert_eq!(found.len(), 1);

    let unusable = json!({"_id": 2, "k": [1, 2]}).as_object().cloned().unwrap();
    let err = router.insert(&ns, vec![unusable]).unwrap_err();
    assert!(matches!(err, KestrelError::BadValue(_)), "{err}");
    assert_eq!(router.count(&ns, &Filter::all()).unwrap(), 1);
}

#[test]
fn test_stale_router_retries_after_chunk_move() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let stale = cluster.router("stale");
    stale.insert(&ns, docs(0..100)).unwrap();
    assert_eq!(stale.count(&ns, &Filter::all()).unwrap(), 100);

    // Moved behind the router's back.
    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(50),
            to: ShardId(1),
        })
        .unwrap();

    let found = stale.find(&ns, &Filter::eq("k", json!(75))).unwrap();
    assert_eq!(found.len(), 1);
    assert!(stale.snapshot().stale_retries > 0);
    assert_eq!(
        stale.route(&ns, &Filter::eq("k", json!(75))).unwrap(),
        BTreeSet::from([ShardId(1)])
    );
    // Orphans left on the donor stay invisible.
    assert_eq!(stale.count(&ns, &Filter::all()).unwrap(), 100);
}

#[test]
fn test_move_primary_keeps_unsharded_collection_readable() {
    let cluster = cluster(2);
    let notes = Namespace::new("app", "notes");
    cluster
        .admin(ClusterCommand::EnableSharding {
            db: "app".into(),
            primary: Some(ShardId(1)),
        })
        .unwrap();
    let router = cluster.router("r1");
    router.insert(&notes, docs(0..3)).unwrap();
    assert_eq!(stored_on(&cluster, ShardId(1), &notes), 3);

    cluster
        .admin(ClusterCommand::MovePrimary {
            db: "app".into(),
            to: ShardId(2),
        })
        .unwrap();

    assert_eq!(router.find(&notes, &Filter::all()).unwrap().len(), 3);
    assert_eq!(stored_on(&cluster, ShardId(2), &notes), 3);
    assert_eq!(stored_on(&cluster, ShardId(1), &notes), 0);
    assert_eq!(cluster.catalog().get_database("app").unwrap().primary, ShardId(2));
}

#[test]
fn test_new_epoch_forces_full_routing_reload() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let stale = cluster.router("stale");
    stale.insert(&ns, docs(0..10)).unwrap();
    let before = stale.snapshot().cache;

    // Recreated behind the router's back: same key, new epoch, other split.
    cluster.admin(ClusterCommand::DropCollection { ns: ns.clone() }).unwrap();
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
            at: key(20),
        })
        .unwrap();
    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(20),
            to: ShardId(2),
        })
        .unwrap();

    // The cached table still sends k=30 to shard 1.
    stale.insert(&ns, vec![doc(30)]).unwrap();
    assert_eq!(stored_on(&cluster, ShardId(2), &ns), 1);
    assert_eq!(stored_on(&cluster, ShardId(1), &ns), 0);

    let after = stale.snapshot();
    assert!(after.stale_retries > 0);
    assert!(after.cache.full_refreshes > before.full_refreshes);
    assert_eq!(after.cache.incremental_refreshes, before.incremental_refreshes);
    assert_eq!(
        stale.route(&ns, &Filter::eq("k", json!(30))).unwrap(),
        BTreeSet::from([ShardId(2)])
    );
    assert_eq!(stale.count(&ns, &Filter::all()).unwrap(), 1);
}
