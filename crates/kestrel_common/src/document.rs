//! JSON documents, dotted-path access and update specifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KestrelError, KestrelResult};
use crate::shard_key::KeyValue;

pub type Document = Map<String, Value>;

/// Identity of a document inside one collection: its `_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey(pub KeyValue);

impl DocKey {
    pub fn of(doc: &Document) -> KestrelResult<DocKey> {
        let id = doc
            .get("_id")
            .ok_or_else(|| KestrelError::BadValue("document is missing _id".into()))?;
        KeyValue::from_json(id)
            .map(DocKey)
            .ok_or_else(|| KestrelError::BadValue(format!("unsupported _id value: {id}")))
    }

    pub fn to_json(&self) -> Value {
        self.0.to_json()
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut cur = doc.get(first)?;
    for p in parts {
        cur = cur.as_object()?.get(p)?;
    }
    Some(cur)
}

pub fn set_path(doc: &mut Document, path: &str, value: Value) -> KestrelResult<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| KestrelError::BadValue("empty field path".into()))?;
    let mut cur = doc;
    for p in parents {
        let entry = cur
            .entry(p.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        cur = entry.as_object_mut().ok_or_else(|| {
            KestrelError::BadValue(format!("cannot create field '{path}': '{p}' is not an object"))
        })?;
    }
    cur.insert(last.to_string(), value);
    Ok(())
}

pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts.split_last()?;
    let mut cur = doc;
    for p in parents {
        cur = cur.get_mut(*p)?.as_object_mut()?;
    }
    cur.remove(*last)
}

/// Parsed update argument: a replacement document or modifier operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateSpec {
    Replace(Document),
    Modifiers {
        set: Document,
        inc: Document,
        unset: Vec<String>,
    },
}

/// Result of applying an update to a pre-image.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub post_image: Document,
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
    pub is_replacement: bool,
}

impl UpdateSpec {
    pub fn parse(v: &Value) -> KestrelResult<UpdateSpec> {
        let obj = v
            .as_object()
            .ok_or_else(|| KestrelError::BadValue("update must be an object".into()))?;
        let has_ops = obj.keys().any(|k| k.starts_with('$'));
        if !has_ops {
            return Ok(UpdateSpec::Replace(obj.clone()));
        }
        let mut set = Document::new();
        let mut inc = Document::new();
        let mut unset = Vec::new();
        for (op, arg) in obj {
            let fields = arg.as_object().ok_or_else(|| {
                KestrelError::BadValue(format!("argument of {op} must be an object"))
            })?;
            match op.as_str() {
                "$set" => set.extend(fields.clone()),
                "$inc" => {
                    for (f, n) in fields {
                        if !n.is_number() {
                            return Err(KestrelError::BadValue(format!(
                                "cannot $inc with non-numeric argument for '{f}'"
                            )));
                        }
                        inc.insert(f.clone(), n.clone());
                    }
                }
                "$unset" => unset.extend(fields.keys().cloned()),
                other if !other.starts_with('$') => {
                    return Err(KestrelError::BadValue(
                        "cannot mix replacement fields and update operators".into(),
                    ))
                }
                other => {
                    return Err(KestrelError::BadValue(format!(
                        "unknown update operator {other}"
                    )))
                }
            }
        }
        Ok(UpdateSpec::Modifiers { set, inc, unset })
    }

    /// Paths this update may modify. Replacements touch every field.
    pub fn touched_paths(&self) -> Option<Vec<&str>> {
        match self {
            UpdateSpec::Replace(_) => None,
            UpdateSpec::Modifiers { set, inc, unset } => Some(
                set.keys()
                    .chain(inc.keys())
                    .map(String::as_str)
                    .chain(unset.iter().map(String::as_str))
                    .collect(),
            ),
        }
    }

    pub fn apply(&self, pre_image: &Document) -> KestrelResult<UpdateOutcome> {
        match self {
            UpdateSpec::Replace(replacement) => {
                let mut post = Document::new();
                let id = pre_image.get("_id").cloned().unwrap_or(Value::Null);
                if let Some(new_id) = replacement.get("_id") {
                    if *new_id != id {
                        return Err(KestrelError::ImmutableField("_id".into()));
                    }
                }
                post.insert("_id".into(), id);
                for (k, v) in replacement {
                    if k != "_id" {
                        post.insert(k.clone(), v.clone());
                    }
                }
                Ok(UpdateOutcome {
                    post_image: post,
                    updated_fields: Document::new(),
                    removed_fields: Vec::new(),
                    is_replacement: true,
                })
            }
            UpdateSpec::Modifiers { set, inc, unset } => {
                let mut post = pre_image.clone();
                let mut updated = Document::new();
                for (path, v) in set {
                    if path == "_id" && pre_image.get("_id") != Some(v) {
                        return Err(KestrelError::ImmutableField("_id".into()));
                    }
                    set_path(&mut post, path, v.clone())?;
                    updated.insert(path.clone(), v.clone());
                }
                for (path, delta) in inc {
                    let current = get_path(&post, path).cloned().unwrap_or(Value::from(0));
                    let next = add_numbers(&current, delta).ok_or_else(|| {
                        KestrelError::BadValue(format!(
                            "cannot apply $inc to non-numeric field '{path}'"
                        ))
                    })?;
                    set_path(&mut post, path, next.clone())?;
                    updated.insert(path.clone(), next);
                }
                let mut removed = Vec::new();
                for path in unset {
                    if remove_path(&mut post, path).is_some() {
                        removed.push(path.clone());
                    }
                }
                Ok(UpdateOutcome {
                    post_image: post,
                    updated_fields: updated,
                    removed_fields: removed,
                    is_replacement: false,
                })
            }
        }
    }
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Some(Value::from(x.checked_add(y)?)),
        _ => {
            let x = a.as_f64()?;
            let y = b.as_f64()?;
            serde_json::Number::from_f64(x + y).map(Value::Number)
        }
    }
}

/// Approximate stored size of a document.
pub fn doc_size(doc: &Document) -> usize {
    serde_json::to_vec(doc).map(|b| b.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_doc_key_requires_id() {
        assert!(DocKey::of(&doc(json!({"x": 1}))).is_err());
        assert_eq!(
            DocKey::of(&doc(json!({"_id": "a"}))).unwrap(),
            DocKey(KeyValue::Str("a".into()))
        );
    }

    #[test]
    fn test_modifiers_produce_post_image_and_field_lists() {
        let pre = doc(json!({"_id": 1, "n": 2, "gone": true, "sub": {"a": 1}}));
        let spec =
            UpdateSpec::parse(
                &json!({"$inc": {"n": 3}, "$set": {"sub.b": 2}, "$unset": {"gone": ""}}),
            )
                .unwrap();
        let out = spec.apply(&pre).unwrap();
        assert_eq!(
            Value::Object(out.post_image),
            json!({"_id": 1, "n": 5, "sub": {"a": 1, "b": 2}})
        );
        assert_eq!(out.updated_fields.get("n"), Some(&json!(5)));
        assert_eq!(out.removed_fields, vec!["gone".to_string()]);
    }

    #[test]
    fn test_replacement_preserves_id() {
        let pre = doc(json!({"_id": 9, "a": 1}));
        let out = UpdateSpec::parse(&json!({"b": 2})).unwrap().apply(&pre).unwrap();
        assert_eq!(Value::Object(out.post_image), json!({"_id": 9, "b": 2}));
        assert!(out.is_replacement);
        let bad = UpdateSpec::parse(&json!({"_id": 10})).unwrap();
        assert!(matches!(bad.apply(&pre), Err(KestrelError::ImmutableField(_))));
    }

    #[test]
    fn test_parse_rejects_mixed_update() {
        assert!(UpdateSpec::parse(&json!({"$set": {"a": 1}, "b": 2})).is_err());
        assert!(UpdateSpec::parse(&json!({"$inc": {"a": "x"}})).is_err());
    }
}
