use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kestrel_common::{
    Document, KestrelResult, KeyValue, LogicalTimestamp, Lsid, Namespace, ShardKeyPattern,
    TxnNumber,
};

use super::ResumeToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    DropDatabase,
    ReshardCollection,
    Invalidate,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::ReshardCollection => "reshardCollection",
            OperationType::Invalidate => "invalidate",
        }
    }

    /// Events that carry a document and may need a pre-image.
    pub fn is_crud(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub operation_type: OperationType,
    pub cluster_time: LogicalTimestamp,
    pub ns: Namespace,
    pub document_key: Option<KeyValue>,
    pub full_document: Option<Document>,
    pub full_document_before_change: Option<Document>,
    pub update_description: Option<UpdateDescription>,
    pub lsid: Option<Lsid>,
    pub txn_number: Option<TxnNumber>,
    /// Set on `reshardCollection` events.
    pub new_shard_key: Option<ShardKeyPattern>,
}

impl ChangeEvent {
    pub fn new(token: ResumeToken, operation_type: OperationType, ns: Namespace) -> Self {
        Self {
            cluster_time: token.cluster_time,
            document_key: token.document_key.clone(),
            token,
            operation_type,
            ns,
            full_document: None,
            full_document_before_change: None,
            update_description: None,
            lsid: None,
            txn_number: None,
            new_shard_key: None,
        }
    }

    /// The `invalidate` that closes a stream after this event.
    pub fn invalidate(&self) -> Self {
        ChangeEvent::new(
            ResumeToken::invalidate(&self.token),
            OperationType::Invalidate,
            self.ns.clone(),
        )
    }

    /// Document form handed to pipeline stages and clients.
    pub fn to_document(&self) -> KestrelResult<Document> {
        let mut doc = json!({
            "_id": self.token.encode()?,
            "operationType": self.operation_type.as_str(),
            "clusterTime": {"t": self.cluster_time.secs, "i": self.cluster_time.counter},
            "ns": {"db": self.ns.db, "coll": self.ns.coll},
        });
        let Some(obj) = doc.as_object_mut() else {
            return Ok(Document::new());
        };
        if let Some(k) = &self.document_key {
            obj.insert("documentKey".into(), json!({"_id": k.to_json()}));
        }
        if let Some(d) = &self.full_document {
            obj.insert("fullDocument".into(), Value::Object(d.clone()));
        }
        if let Some(d) = &self.full_document_before_change {
            obj.insert("fullDocumentBeforeChange".into(), Value::Object(d.clone()));
        }
        if let Some(u) = &self.update_description {
            obj.insert(
                "updateDescription".into(),
                json!({
                    "updatedFields": Value::Object(u.updated_fields.clone()),
                    "removedFields": u.removed_fields,
                }),
            );
        }
        if let Some(lsid) = &self.lsid {
            obj.insert("lsid".into(), json!(lsid.0.to_string()));
        }
        if let Some(n) = self.txn_number {
            obj.insert("txnNumber".into(), json!(n.0));
        }
        if let Some(p) = &self.new_shard_key {
            obj.insert("shardKey".into(), json!(p.fields));
        }
        Ok(std::mem::take(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::ShardId;

    #[test]
    fn test_update_event_document() {
        let token = ResumeToken::event(
            LogicalTimestamp::new(7, 1),
            ShardId(0),
            0,
            Some(KeyValue::Int(4)),
            None,
        );
        let mut e = ChangeEvent::new(token, OperationType::Update, Namespace::new("app", "users"));
        let mut fields = Document::new();
        fields.insert("name".into(), json!("ada"));
        e.update_description = Some(UpdateDescription {
            updated_fields: fields,
            removed_fields: vec!["tmp".into()],
        });
        let doc = e.to_document().unwrap();
        assert_eq!(doc["operationType"], json!("update"));
        assert_eq!(doc["documentKey"], json!({"_id": 4}));
        assert_eq!(doc["updateDescription"]["removedFields"], json!(["tmp"]));
        assert_eq!(
            ResumeToken::decode(doc["_id"].as_str().unwrap()).unwrap(),
            e.token
        );
        assert!(!doc.contains_key("fullDocument"));
    }
}
