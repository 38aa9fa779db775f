//! Shard targeting for reads and writes.

use std::collections::BTreeSet;

use kestrel_common::shard_key::KeyBounds;
use kestrel_common::{Filter, KestrelError, KestrelResult, ShardId};

use super::catalog_cache::Route;
use crate::messages::WriteOp;

/// Shards whose ranges intersect what `filter` can match.
pub fn targets_for_filter(route: &Route, filter: &Filter) -> BTreeSet<ShardId> {
    match route {
        Route::NoDatabase => BTreeSet::new(),
        Route::Unsharded { primary, .. } => BTreeSet::from([*primary]),
        Route::Sharded(r) => {
            let bounds = filter.key_bounds(r.chunks.pattern());
            r.chunks.shards_for_bounds(&bounds)
        }
    }
}

/// Shards a write statement must reach.
///
/// Inserts go to the owner of the document's shard key. Single-document
/// updates and deletes, and upserts, must resolve to exactly one shard.
pub fn targets_for_write(route: &Route, op: &WriteOp) -> KestrelResult<BTreeSet<ShardId>> {
    let routing = match route {
        Route::NoDatabase => {
            return Err(KestrelError::Internal(
                "write targeted before its database was created".into(),
            ))
        }
        Route::Unsharded { primary, .. } => return Ok(BTreeSet::from([*primary])),
        Route::Sharded(r) => r,
    };
    let pattern = routing.chunks.pattern();
    match op {
        WriteOp::Insert { doc } => {
            let key = pattern.extract(doc).ok_or_else(|| {
                KestrelError::BadValue(format!(
                    "document has an unusable shard key for {}",
                    routing.entry.ns
                ))
            })?;
            let owner = routing.chunks.owner(&key).ok_or_else(|| {
                KestrelError::internal_bug(
                    "E-ROUTE-001",
                    format!("no chunk owns the shard key in {}", routing.entry.ns),
                    format!("{key:?}"),
                )
            })?;
            Ok(BTreeSet::from([owner]))
        }
        WriteOp::Update {
            filter,
            upsert,
            multi,
            ..
        } => {
            if *upsert {
                let bounds = filter.key_bounds(pattern);
                if !matches!(&bounds, KeyBounds::Points(p) if p.len() == 1) {
                    return Err(KestrelError::BadValue(format!(
                        "upsert on {} must include an equality on the full shard key {}",
                        routing.entry.ns, pattern
                    )));
                }
            }
            single_or_multi(route, filter, *multi, op)
        }
        WriteOp::Delete { filter, multi } => single_or_multi(route, filter, *multi, op),
    }
}

fn single_or_multi(
    route: &Route,
    filter: &Filter,
    multi: bool,
    op: &WriteOp,
) -> KestrelResult<BTreeSet<ShardId>> {
    let targets = targets_for_filter(route, filter);
    if !multi && targets.len() > 1 {
        return Err(KestrelError::BadValue(format!(
            "single-document {} must target one shard; include the shard key in the filter",
            op.name()
        )));
    }
    Ok(targets)
}

/// Statements that modify at most one document.
pub fn is_single_target(op: &WriteOp) -> bool {
    match op {
        WriteOp::Insert { .. } => true,
        WriteOp::Update { multi, .. } | WriteOp::Delete { multi, .. } => !multi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::catalog::{ChunkMap, CollectionEntry, CollectionRouting};
    use kestrel_common::{
        CollectionUuid, DatabaseVersion, KeyValue, Namespace, ShardKey, ShardKeyPattern,
        UpdateSpec,
    };

    fn sharded() -> Route {
        let ns = Namespace::new("app", "orders");
        let pattern = ShardKeyPattern::ranged(&["cust"]);
        let mut chunks = ChunkMap::single(ns.clone(), pattern.clone(), ShardId(1));
        let at = ShardKey(vec![KeyValue::Int(100)]);
        chunks.split(&at).unwrap();
        let upper = chunks.chunk_for(&at).unwrap().range.clone();
        chunks.move_chunk(&upper, ShardId(2)).unwrap();
        Route::Sharded(Arc::new(CollectionRouting {
            entry: CollectionEntry {
                ns,
                uuid: CollectionUuid::generate(),
                key_pattern: pattern,
                unique: false,
                resharding: false,
            },
            chunks,
        }))
    }

    fn doc(v: serde_json::Value) -> kestrel_common::Document {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_insert_goes_to_key_owner() {
        let route = sharded();
        let low = WriteOp::Insert { doc: doc(json!({"_id": 1, "cust": 5})) };
        let high = WriteOp::Insert { doc: doc(json!({"_id": 2, "cust": 500})) };
        assert_eq!(targets_for_write(&route, &low).unwrap(), BTreeSet::from([ShardId(1)]));
        assert_eq!(targets_for_write(&route, &high).unwrap(), BTreeSet::from([ShardId(2)]));
    }

    #[test]
    fn test_unconstrained_filter_broadcasts() {
        let route = sharded();
        let targets = targets_for_filter(&route, &Filter::all());
        assert_eq!(targets, BTreeSet::from([ShardId(1), ShardId(2)]));
        let one = targets_for_filter(&route, &Filter::eq("cust", json!(7)));
        assert_eq!(one, BTreeSet::from([ShardId(1)]));
    }

    #[test]
    fn test_single_delete_without_shard_key_is_rejected() {
        let route = sharded();
        let op = WriteOp::Delete { filter: Filter::eq("status", json!("open")), multi: false };
        assert!(matches!(targets_for_write(&route, &op), Err(KestrelError::BadValue(_))));
        let multi = WriteOp::Delete { filter: Filter::eq("status", json!("open")), multi: true };
        assert_eq!(targets_for_write(&route, &multi).unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_requires_full_shard_key() {
        let route = sharded();
        let op = WriteOp::Update {
            filter: Filter::eq("_id", json!(3)),
            update: UpdateSpec::Replace(doc(json!({"cust": 3}))),
            upsert: true,
            multi: false,
        };
        assert!(matches!(targets_for_write(&route, &op), Err(KestrelError::BadValue(_))));
    }

    #[test]
    fn test_unsharded_goes_to_primary() {
        let route = Route::Unsharded {
            primary: ShardId(3),
            version: DatabaseVersion::generate(),
        };
        let op = WriteOp::Delete { filter: Filter::all(), multi: true };
        assert_eq!(targets_for_write(&route, &op).unwrap(), BTreeSet::from([ShardId(3)]));
    }
}
