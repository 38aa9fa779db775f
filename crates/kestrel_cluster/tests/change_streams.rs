mod common;

use serde_json::json;

use kestrel_cluster::fault_injection::HANG_BEFORE_DELIVERING_DECISION;
use kestrel_cluster::{
    ClientSession, EventFilter, FullDocumentMode, OperationType, PreImageMode, WatchTarget,
};
use kestrel_common::error::ChangeStreamError;
use kestrel_storage::CollectionOptions;

use common::*;

fn ops(events: &[ChangeEvent]) -> Vec<OperationType> {
    events.iter().map(|e| e.operation_type).collect()
}

fn keys(events: &[ChangeEvent]) -> Vec<Option<KeyValue>> {
    events.iter().map(|e| e.document_key.clone()).collect()
}

fn set_v(v: i64) -> UpdateSpec {
    UpdateSpec::parse(&json!({"$set": {"v": v}})).unwrap()
}

#[test]
fn test_crud_events_in_order() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();

    router.insert(&ns, vec![doc(10)]).unwrap();
    router.update(&ns, Filter::eq("k", json!(10)), set_v(5), false, false).unwrap();
    router.delete(&ns, Filter::eq("k", json!(10)), false).unwrap();

    let events = drain(&mut cursor, 3);
    assert_eq!(
        ops(&events),
        vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
    );
    assert!(events.iter().all(|e| e.document_key == Some(KeyValue::Int(10))));
    assert_eq!(
        events[0].full_document.as_ref().and_then(|d| d.get("v")),
        Some(&json!(0))
    );
    let update = events[1].update_description.as_ref().unwrap();
    assert_eq!(update.updated_fields.get("v"), Some(&json!(5)));
    assert!(events[1].full_document.is_none());
    assert!(events.windows(2).all(|w| w[0].token < w[1].token));
}

#[test]
fn test_resume_after_token_skips_seen_events() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();
    for k in [1, 2, 3] {
        router.insert(&ns, vec![doc(k)]).unwrap();
    }
    let seen = drain(&mut cursor, 3);
    assert_eq!(seen.len(), 3);

    let options = ChangeStreamOptions {
        resume_after: Some(seen[0].token.clone()),
        ..Default::default()
    };
    let mut resumed = router.watch(WatchTarget::Collection(ns.clone()), options).unwrap();
    let rest = drain(&mut resumed, 2);
    assert_eq!(
        keys(&rest),
        vec![Some(KeyValue::Int(2)), Some(KeyValue::Int(3))]
    );
}

#[test]
fn test_encoded_token_round_trips_through_resume() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();
    router.insert(&ns, vec![doc(4), doc(60)]).unwrap();
    let seen = drain(&mut cursor, 2);
    let encoded = seen[0].token.encode().unwrap();

    let options = ChangeStreamOptions {
        resume_after: Some(kestrel_cluster::ResumeToken::decode(&encoded).unwrap()),
        ..Default::default()
    };
    let mut resumed = router.watch(WatchTarget::Collection(ns.clone()), options).unwrap();
    let rest = drain(&mut resumed, 1);
    assert_eq!(keys(&rest), vec![seen[1].document_key.clone()]);
    assert!(kestrel_cluster::ResumeToken::decode("not a token").is_err());
}

#[test]
fn test_events_from_both_shards_merge_in_commit_order() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();
    for k in [10, 90, 20, 80] {
        router.insert(&ns, vec![doc(k)]).unwrap();
    }

    let events = drain(&mut cursor, 4);
    assert_eq!(
        keys(&events),
        [10, 90, 20, 80].map(|k| Some(KeyValue::Int(k))).to_vec()
    );
    assert!(events.windows(2).all(|w| w[0].cluster_time < w[1].cluster_time));
    let shards: Vec<ShardId> = events.iter().map(|e| e.token.shard).collect();
    assert_eq!(shards, vec![ShardId(1), ShardId(2), ShardId(1), ShardId(2)]);
}

#[test]
fn test_migration_is_invisible_to_streams() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    router.insert(&ns, docs(40..60)).unwrap();
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();

    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: upper_from(50),
            to: ShardId(1),
        })
        .unwrap();
    cluster.run_maintenance();
    router.insert(&ns, vec![doc(99)]).unwrap();

    let events = drain(&mut cursor, 1);
    assert_eq!(ops(&events), vec![OperationType::Insert]);
    assert_eq!(keys(&events), vec![Some(KeyValue::Int(99))]);
    // Nothing else is pending.
    assert!(cursor.next_batch().unwrap().events.is_empty());
}

#[test]
fn test_drop_invalidates_collection_stream() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();
    router.insert(&ns, vec![doc(10)]).unwrap();
    cluster.admin(ClusterCommand::DropCollection { ns: ns.clone() }).unwrap();

    let events = drain(&mut cursor, 3);
    assert_eq!(
        ops(&events),
        vec![OperationType::Insert, OperationType::Drop, OperationType::Invalidate]
    );
    assert!(cursor.is_closed());
    let err = cursor.next_batch().unwrap_err();
    assert!(
        matches!(err, KestrelError::ChangeStream(ChangeStreamError::Invalidated)),
        "{err}"
    );

    let invalidate = events[2].token.clone();
    let resume = ChangeStreamOptions {
        resume_after: Some(invalidate.clone()),
        ..Default::default()
    };
    let err = router
        .watch(WatchTarget::Collection(ns.clone()), resume)
        .unwrap_err();
    assert!(
        matches!(err, KestrelError::ChangeStream(ChangeStreamError::InvalidResumeToken(_))),
        "{err}"
    );

    let start_after = ChangeStreamOptions {
        start_after: Some(invalidate),
        ..Default::default()
    };
    let mut reopened = router
        .watch(WatchTarget::Collection(ns.clone()), start_after)
        .unwrap();
    router.insert(&ns, vec![doc(11)]).unwrap();
    let events = drain(&mut reopened, 1);
    assert_eq!(ops(&events), vec![OperationType::Insert]);
    assert_eq!(keys(&events), vec![Some(KeyValue::Int(11))]);
}

#[test]
fn test_database_stream_survives_collection_drop() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let other = Namespace::new("app", "orders");
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Database("app".into()), ChangeStreamOptions::default())
        .unwrap();
    router.insert(&ns, vec![doc(10)]).unwrap();
    cluster.admin(ClusterCommand::DropCollection { ns: ns.clone() }).unwrap();
    router.insert(&other, vec![doc(1)]).unwrap();

    let events = drain(&mut cursor, 3);
    assert_eq!(
        ops(&events),
        vec![OperationType::Insert, OperationType::Drop, OperationType::Insert]
    );
    assert_eq!(events[2].ns, other);
    assert!(!cursor.is_closed());
}

#[test]
fn test_update_lookup_attaches_current_document() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let options = ChangeStreamOptions {
        full_document: FullDocumentMode::UpdateLookup,
        ..Default::default()
    };
    let mut cursor = router.watch(WatchTarget::Collection(ns.clone()), options).unwrap();
    router.insert(&ns, vec![doc(70)]).unwrap();
    router.update(&ns, Filter::eq("k", json!(70)), set_v(3), false, false).unwrap();

    let events = drain(&mut cursor, 2);
    assert_eq!(ops(&events), vec![OperationType::Insert, OperationType::Update]);
    let full = events[1].full_document.as_ref().unwrap();
    assert_eq!(full.get("v"), Some(&json!(3)));
    assert_eq!(full.get("k"), Some(&json!(70)));
}

#[test]
fn test_event_filter_limits_operation_types() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let options = ChangeStreamOptions {
        filter: EventFilter::op_types([OperationType::Delete]),
        ..Default::default()
    };
    let mut cursor = router.watch(WatchTarget::Collection(ns.clone()), options).unwrap();
    router.insert(&ns, vec![doc(10), doc(90)]).unwrap();
    router.delete(&ns, Filter::eq("k", json!(90)), false).unwrap();

    let events = drain(&mut cursor, 1);
    assert_eq!(ops(&events), vec![OperationType::Delete]);
    assert_eq!(keys(&events), vec![Some(KeyValue::Int(90))]);
}

#[test]
fn test_required_pre_images_need_collection_option() {
    let cluster = cluster(2);
    let ns = Namespace::new("app", "ledger");
    cluster
        .admin(ClusterCommand::EnableSharding {
            db: "app".into(),
            primary: Some(ShardId(1)),
        })
        .unwrap();
    cluster
        .admin(ClusterCommand::CreateCollection {
            ns: ns.clone(),
            options: CollectionOptions { pre_images: false },
        })
        .unwrap();
    let router = cluster.router("r1");
    router.insert(&ns, vec![doc(10)]).unwrap();

    let required = || ChangeStreamOptions {
        full_document_before_change: PreImageMode::Required,
        ..Default::default()
    };
    let mut cursor = router.watch(WatchTarget::Collection(ns.clone()), required()).unwrap();
    let err = cursor.next_batch().unwrap_err();
    assert!(
        matches!(err, KestrelError::ChangeStream(ChangeStreamError::PreImagesRequired(_))),
        "{err}"
    );

    cluster
        .admin(ClusterCommand::CollMod {
            ns: ns.clone(),
            options: CollectionOptions { pre_images: true },
        })
        .unwrap();
    let mut cursor = router.watch(WatchTarget::Collection(ns.clone()), required()).unwrap();
    router.delete(&ns, Filter::eq("k", json!(10)), false).unwrap();

    let events = drain(&mut cursor, 1);
    assert_eq!(ops(&events), vec![OperationType::Delete]);
    let before = events[0].full_document_before_change.as_ref().unwrap();
    assert_eq!(before.get("k"), Some(&json!(10)));
}

#[test]
fn test_resume_across_migration_has_no_gaps_or_repeats() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let options = ChangeStreamOptions {
        batch_size: 2,
        ..Default::default()
    };
    let mut cursor = router.watch(WatchTarget::Collection(ns.clone()), options).unwrap();
    for k in [10, 60, 20] {
        router.insert(&ns, vec![doc(k)]).unwrap();
    }
    let first = drain(&mut cursor, 2);
    assert_eq!(keys(&first), vec![Some(KeyValue::Int(10)), Some(KeyValue::Int(60))]);
    drop(cursor);

    // The lower chunk, with the unread insert of 20, moves to shard 2.
    cluster
        .admin(ClusterCommand::MoveChunk {
            ns: ns.clone(),
            range: lower_to(50),
            to: ShardId(2),
        })
        .unwrap();
    cluster.run_maintenance();
    router.insert(&ns, vec![doc(30), doc(70)]).unwrap();

    let resume = ChangeStreamOptions {
        resume_after: Some(first[1].token.clone()),
        ..Default::default()
    };
    let mut resumed = router.watch(WatchTarget::Collection(ns.clone()), resume).unwrap();
    let rest = drain(&mut resumed, 3);
    assert_eq!(
        keys(&rest),
        [20, 30, 70].map(|k| Some(KeyValue::Int(k))).to_vec()
    );
    assert!(rest.iter().all(|e| e.operation_type == OperationType::Insert));
    assert!(resumed.next_batch().unwrap().events.is_empty());
}

#[test]
fn test_resume_point_waits_for_prepared_transaction() {
    let cluster = cluster(2);
    let ns = users();
    sharded_split(&cluster, &ns);
    let router = cluster.router("r1");
    let mut cursor = router
        .watch(WatchTarget::Collection(ns.clone()), ChangeStreamOptions::default())
        .unwrap();

    // Both participants stay prepared until the decision is delivered.
    let session = ClientSession::new();
    let mut txn = router.start_transaction(&session);
    txn.insert(&ns, vec![doc(30), doc(70)]).unwrap();
    cluster.failpoints().enable(HANG_BEFORE_DELIVERING_DECISION);
    assert!(txn.commit().is_err());
    cluster.failpoints().disable(HANG_BEFORE_DELIVERING_DECISION);
    router.insert(&ns, vec![doc(20)]).unwrap();

    let held = cursor.next_batch().unwrap();
    assert!(held.events.is_empty());
    let held_at = held.post_batch_resume_token;

    cluster.run_maintenance();
    let events = drain(&mut cursor, 3);
    let mut seen = keys(&events);
    seen.sort();
    assert_eq!(seen, [20, 30, 70].map(|k| Some(KeyValue::Int(k))).to_vec());
    assert!(events.iter().all(|e| e.token > held_at));
}
