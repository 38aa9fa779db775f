//! Shard-key values, compound keys, key patterns and half-open key ranges.

use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{get_path, Document};

/// A single shard-key component.
///
/// Variant order is the comparison order: `MinKey < Null < Int < Str < Bool < MaxKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl KeyValue {
    /// Convert a JSON scalar. Arrays, objects and non-integral numbers cannot
    /// be key values.
    pub fn from_json(v: &Value) -> Option<KeyValue> {
        match v {
            Value::Null => Some(KeyValue::Null),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(KeyValue::Int(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| KeyValue::Int(f as i64))
                }
            }
            Value::Object(o) if o.contains_key("$minKey") => Some(KeyValue::MinKey),
            Value::Object(o) if o.contains_key("$maxKey") => Some(KeyValue::MaxKey),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => serde_json::json!({ "$minKey": 1 }),
            KeyValue::MaxKey => serde_json::json!({ "$maxKey": 1 }),
            KeyValue::Null => Value::Null,
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Str(s) => Value::from(s.clone()),
            KeyValue::Bool(b) => Value::from(*b),
        }
    }

    /// Hash used by hashed shard-key patterns.
    pub fn hashed(&self) -> KeyValue {
        let bytes = match self {
            KeyValue::MinKey | KeyValue::MaxKey => return self.clone(),
            KeyValue::Null => b"n".to_vec(),
            KeyValue::Int(i) => {
                let mut b = vec![b'i'];
                b.extend_from_slice(&i.to_be_bytes());
                b
            }
            KeyValue::Str(s) => {
                let mut b = vec![b's'];
                b.extend_from_slice(s.as_bytes());
                b
            }
            KeyValue::Bool(v) => vec![b'b', *v as u8],
        };
        KeyValue::Int(xxhash_rust::xxh3::xxh3_64(&bytes) as i64)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::MaxKey => write!(f, "MaxKey"),
            KeyValue::Null => write!(f, "null"),
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Str(s) => write!(f, "{s:?}"),
            KeyValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Str(v.to_string())
    }
}

/// Compound shard-key value. Compares lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn single(v: impl Into<KeyValue>) -> Self {
        ShardKey(vec![v.into()])
    }

    pub fn global_min(width: usize) -> Self {
        ShardKey(vec![KeyValue::MinKey; width.max(1)])
    }

    pub fn global_max(width: usize) -> Self {
        ShardKey(vec![KeyValue::MaxKey; width.max(1)])
    }

    pub fn is_global_min(&self) -> bool {
        self.0.iter().all(|v| *v == KeyValue::MinKey)
    }

    pub fn is_global_max(&self) -> bool {
        self.0.iter().all(|v| *v == KeyValue::MaxKey)
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Half-open key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl KeyRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Self {
        Self { min, max }
    }

    pub fn full(width: usize) -> Self {
        Self::new(ShardKey::global_min(width), ShardKey::global_max(width))
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        self.min <= *key && *key < self.max
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True if `other` lies entirely inside `self`.
    pub fn covers(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// Whether any key matched by `bounds` may fall into this range.
    pub fn overlaps_bounds(&self, bounds: &KeyBounds) -> bool {
        match bounds {
            KeyBounds::All => true,
            KeyBounds::Points(points) => points.iter().any(|p| self.contains(p)),
            KeyBounds::Interval { lower, upper } => {
                let below_max = match lower {
                    Bound::Unbounded => true,
                    Bound::Included(l) | Bound::Excluded(l) => *l < self.max,
                };
                let above_min = match upper {
                    Bound::Unbounded => true,
                    Bound::Included(u) => *u >= self.min,
                    Bound::Excluded(u) => *u > self.min,
                };
                below_max && above_min
            }
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Shard-key predicate derived from a query filter, in key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBounds {
    /// The filter does not constrain the shard key.
    All,
    /// The filter pins the full shard key to one of these values.
    Points(Vec<ShardKey>),
    Interval {
        lower: Bound<ShardKey>,
        upper: Bound<ShardKey>,
    },
}

/// Fields (and hashing) that form a collection's shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub fields: Vec<String>,
    pub hashed: bool,
}

impl ShardKeyPattern {
    pub fn ranged(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            hashed: false,
        }
    }

    /// Hashed patterns are single-field.
    pub fn hashed(field: &str) -> Self {
        Self {
            fields: vec![field.to_string()],
            hashed: true,
        }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn full_range(&self) -> KeyRange {
        KeyRange::full(self.width())
    }

    /// Extract the shard key from a document. A missing field extracts as
    /// `Null`; `None` means the document holds an unusable key value.
    pub fn extract(&self, doc: &Document) -> Option<ShardKey> {
        let mut out = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let v = match get_path(doc, field) {
                None => KeyValue::Null,
                Some(v) => KeyValue::from_json(v)?,
            };
            out.push(if self.hashed { v.hashed() } else { v });
        }
        Some(ShardKey(out))
    }

    /// Map raw field values (already extracted in pattern order) into key space.
    pub fn key_from_values(&self, values: Vec<KeyValue>) -> ShardKey {
        if self.hashed {
            ShardKey(values.into_iter().map(|v| v.hashed()).collect())
        } else {
            ShardKey(values)
        }
    }

    pub fn is_shard_key_field(&self, path: &str) -> bool {
        self.fields
            .iter()
            .any(|f| {
                f == path
                    || f.starts_with(&format!("{path}."))
                    || path.starts_with(&format!("{f}."))
            })
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.hashed {
                write!(f, "{field}: \"hashed\"")?;
            } else {
                write!(f, "{field}: 1")?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_value_type_order() {
        let ordered = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Int(-5),
            KeyValue::Int(7),
            KeyValue::Str("a".into()),
            KeyValue::Bool(false),
            KeyValue::MaxKey,
        ];
        let mut sorted = ordered.clone();
        sorted.sort();
        assert_eq!(sorted, ordered);
    }

    #[test]
    fn test_extract_missing_field_is_null() {
        let p = ShardKeyPattern::ranged(&["a", "b"]);
        let k = p.extract(&doc(json!({"_id": 1, "a": 3}))).unwrap();
        assert_eq!(k, ShardKey(vec![KeyValue::Int(3), KeyValue::Null]));
    }

    #[test]
    fn test_extract_rejects_array_values() {
        let p = ShardKeyPattern::ranged(&["a"]);
        assert!(p.extract(&doc(json!({"a": [1, 2]}))).is_none());
    }

    #[test]
    fn test_hashed_extract_is_deterministic() {
        let p = ShardKeyPattern::hashed("x");
        let a = p.extract(&doc(json!({"x": 42}))).unwrap();
        let b = p.extract(&doc(json!({"x": 42, "y": 1}))).unwrap();
        assert_eq!(a, b);
        assert!(matches!(a.0[0], KeyValue::Int(_)));
        assert_ne!(a, ShardKey::single(42));
    }

    #[test]
    fn test_range_contains_half_open() {
        let r = KeyRange::new(ShardKey::single(0), ShardKey::single(10));
        assert!(r.contains(&ShardKey::single(0)));
        assert!(r.contains(&ShardKey::single(9)));
        assert!(!r.contains(&ShardKey::single(10)));
        assert!(KeyRange::full(1).contains(&ShardKey::single("zzz")));
    }

    #[test]
    fn test_range_overlaps_interval_bounds() {
        let r = KeyRange::new(ShardKey::single(10), ShardKey::single(20));
        let below = KeyBounds::Interval {
            lower: Bound::Unbounded,
            upper: Bound::Excluded(ShardKey::single(10)),
        };
        let touching = KeyBounds::Interval {
            lower: Bound::Unbounded,
            upper: Bound::Included(ShardKey::single(10)),
        };
        let above = KeyBounds::Interval {
            lower: Bound::Included(ShardKey::single(20)),
            upper: Bound::Unbounded,
        };
        assert!(!r.overlaps_bounds(&below));
        assert!(r.overlaps_bounds(&touching));
        assert!(!r.overlaps_bounds(&above));
        assert!(r.overlaps_bounds(&KeyBounds::Points(vec![ShardKey::single(15)])));
    }
}
