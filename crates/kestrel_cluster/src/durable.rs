//! Small durable records kept as `{_id, value}` documents in internal
//! collections and written through the replica set's oplog, so they follow
//! the primary across failovers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use kestrel_common::{
    CollectionUuid, DocKey, Document, KestrelError, KestrelResult, KeyValue, Namespace,
};
use kestrel_repl::{CrudOp, OplogDraft, OplogOp, PrimaryWrite};
use kestrel_storage::{CollectionOptions, StorageNode};

/// Uuid of `ns`, creating the collection first if needed.
pub(crate) fn ensure_collection(
    w: &mut PrimaryWrite<'_>,
    ns: &Namespace,
) -> KestrelResult<CollectionUuid> {
    if let Some(info) = w.storage().collection_info(ns) {
        return Ok(info.uuid);
    }
    let uuid = CollectionUuid::generate();
    w.log(OplogDraft::new(
        ns.clone(),
        Some(uuid),
        OplogOp::Create {
            options: CollectionOptions::default(),
        },
    ))?;
    Ok(uuid)
}

/// Insert or replace the record `id`.
pub(crate) fn log_put(
    w: &mut PrimaryWrite<'_>,
    ns: &Namespace,
    id: &str,
    value: &impl Serialize,
) -> KestrelResult<()> {
    let value = serde_json::to_value(value)
        .map_err(|e| KestrelError::Internal(format!("encode record {id} of {ns}: {e}")))?;
    let uuid = ensure_collection(w, ns)?;
    let doc_key = DocKey(KeyValue::Str(id.to_string()));
    let mut doc = Document::new();
    doc.insert("_id".into(), Value::from(id));
    doc.insert("value".into(), value);
    let op = if w.storage().get_latest(ns, &doc_key).is_some() {
        CrudOp::Update {
            doc_key,
            post_image: doc,
            updated_fields: Document::new(),
            removed_fields: Vec::new(),
            is_replacement: true,
        }
    } else {
        CrudOp::Insert { doc }
    };
    w.log(OplogDraft::new(ns.clone(), Some(uuid), OplogOp::Crud(op)))?;
    Ok(())
}

/// Delete the record `id`; missing records are ignored.
pub(crate) fn log_delete(w: &mut PrimaryWrite<'_>, ns: &Namespace, id: &str) -> KestrelResult<()> {
    let Some(info) = w.storage().collection_info(ns) else {
        return Ok(());
    };
    let doc_key = DocKey(KeyValue::Str(id.to_string()));
    if w.storage().get_latest(ns, &doc_key).is_none() {
        return Ok(());
    }
    w.log(OplogDraft::new(
        ns.clone(),
        Some(info.uuid),
        OplogOp::Crud(CrudOp::Delete { doc_key }),
    ))?;
    Ok(())
}

/// The record `id`, if present.
pub(crate) fn get<T: DeserializeOwned>(
    storage: &StorageNode,
    ns: &Namespace,
    id: &str,
) -> KestrelResult<Option<T>> {
    let doc_key = DocKey(KeyValue::Str(id.to_string()));
    storage
        .get_latest(ns, &doc_key)
        .map(|doc| decode(ns, doc))
        .transpose()
}

/// Every record in `ns`, in `_id` order.
pub(crate) fn load<T: DeserializeOwned>(
    storage: &StorageNode,
    ns: &Namespace,
) -> KestrelResult<Vec<T>> {
    storage
        .scan_latest_where(ns, |_| true)
        .into_iter()
        .map(|doc| decode(ns, doc))
        .collect()
}

fn decode<T: DeserializeOwned>(ns: &Namespace, doc: Document) -> KestrelResult<T> {
    let value = doc.get("value").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        KestrelError::internal_bug(
            "E-DURABLE-001",
            format!("undecodable record in {ns}"),
            format!("{e}; doc={}", json!(doc)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::{ClusterClock, ManualWallClock, WriteConcern};
    use kestrel_repl::ReplicaSet;

    #[test]
    fn test_put_replace_delete_survive_failover() {
        let rs = ReplicaSet::new(
            "rs",
            3,
            ClusterClock::new(ManualWallClock::new(10)),
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let ns = Namespace::new("config", "things");
        rs.write_with_concern(WriteConcern::Majority, |w| {
            log_put(w, &ns, "a", &1u32)?;
            log_put(w, &ns, "b", &2u32)?;
            log_put(w, &ns, "a", &3u32)?;
            log_delete(w, &ns, "b")?;
            log_delete(w, &ns, "zzz")
        })
        .unwrap();
        rs.crash(kestrel_common::NodeId(0)).unwrap();
        rs.step_up_best().unwrap();
        let storage = rs.primary_storage().unwrap();
        assert_eq!(load::<u32>(&storage, &ns).unwrap(), vec![3]);
        assert_eq!(get::<u32>(&storage, &ns, "a").unwrap(), Some(3));
        assert_eq!(get::<u32>(&storage, &ns, "b").unwrap(), None);
    }
}
