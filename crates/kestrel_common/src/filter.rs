//! Routing-grade query filters.
//!
//! Only what targeting and shard-local matching need: field equality and the
//! comparison operators `$eq/$gt/$gte/$lt/$lte/$in`, implicitly AND-ed. Richer
//! query shapes belong to the pipeline executor.

use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{get_path, set_path, Document};
use crate::error::{KestrelError, KestrelResult};
use crate::shard_key::{KeyBounds, KeyValue, ShardKey, ShardKeyPattern};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(path: &str, v: Value) -> Self {
        Self {
            conditions: vec![(path.to_string(), Condition::Eq(v))],
        }
    }

    pub fn by_id(id: &KeyValue) -> Self {
        Self::eq("_id", id.to_json())
    }

    pub fn and(mut self, path: &str, cond: Condition) -> Self {
        self.conditions.push((path.to_string(), cond));
        self
    }

    pub fn parse(v: &Value) -> KestrelResult<Filter> {
        let obj = v
            .as_object()
            .ok_or_else(|| KestrelError::BadValue("filter must be an object".into()))?;
        let mut conditions = Vec::new();
        for (path, arg) in obj {
            if path.starts_with('$') {
                return Err(KestrelError::BadValue(format!(
                    "unsupported top-level operator {path}"
                )));
            }
            match arg.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op, operand) in ops {
                        let cond = match op.as_str() {
                            "$eq" => Condition::Eq(operand.clone()),
                            "$gt" => Condition::Gt(operand.clone()),
                            "$gte" => Condition::Gte(operand.clone()),
                            "$lt" => Condition::Lt(operand.clone()),
                            "$lte" => Condition::Lte(operand.clone()),
                            "$in" => Condition::In(
                                operand
                                    .as_array()
                                    .ok_or_else(|| {
                                        KestrelError::BadValue("$in needs an array".into())
                                    })?
                                    .clone(),
                            ),
                            other => {
                                return Err(KestrelError::BadValue(format!(
                                    "unsupported query operator {other}"
                                )))
                            }
                        };
                        conditions.push((path.clone(), cond));
                    }
                }
                _ => conditions.push((path.clone(), Condition::Eq(arg.clone()))),
            }
        }
        Ok(Filter { conditions })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(path, cond)| {
            let field = get_path(doc, path);
            match cond {
                Condition::Eq(v) => eq_match(field, v),
                Condition::In(vs) => vs.iter().any(|v| eq_match(field, v)),
                Condition::Gt(v) => cmp_match(field, v, |o| o == Ordering::Greater),
                Condition::Gte(v) => cmp_match(field, v, |o| o != Ordering::Less),
                Condition::Lt(v) => cmp_match(field, v, |o| o == Ordering::Less),
                Condition::Lte(v) => cmp_match(field, v, |o| o != Ordering::Greater),
            }
        })
    }

    /// `_id` value if the filter is exactly an equality on `_id`.
    pub fn id_equality(&self) -> Option<KeyValue> {
        match self.conditions.as_slice() {
            [(path, Condition::Eq(v))] if path == "_id" => KeyValue::from_json(v),
            _ => None,
        }
    }

    /// Document seeded from equality conditions; used for upserts.
    pub fn equality_seed(&self) -> KestrelResult<Document> {
        let mut doc = Document::new();
        for (path, cond) in &self.conditions {
            if let Condition::Eq(v) = cond {
                set_path(&mut doc, path, v.clone())?;
            }
        }
        Ok(doc)
    }

    fn equalities_on(&self, path: &str) -> Option<Vec<KeyValue>> {
        for (p, cond) in &self.conditions {
            if p != path {
                continue;
            }
            match cond {
                Condition::Eq(v) => return KeyValue::from_json(v).map(|k| vec![k]),
                Condition::In(vs) => {
                    return vs.iter().map(KeyValue::from_json).collect::<Option<Vec<_>>>()
                }
                _ => {}
            }
        }
        None
    }

    fn interval_on(&self, path: &str) -> (Bound<KeyValue>, Bound<KeyValue>) {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        for (p, cond) in &self.conditions {
            if p != path {
                continue;
            }
            let Some(k) = (match cond {
                Condition::Gt(v) | Condition::Gte(v) | Condition::Lt(v) | Condition::Lte(v) => {
                    KeyValue::from_json(v)
                }
                _ => None,
            }) else {
                continue;
            };
            match cond {
                Condition::Gt(_) => lower = tighter_lower(lower, Bound::Excluded(k)),
                Condition::Gte(_) => lower = tighter_lower(lower, Bound::Included(k)),
                Condition::Lt(_) => upper = tighter_upper(upper, Bound::Excluded(k)),
                Condition::Lte(_) => upper = tighter_upper(upper, Bound::Included(k)),
                _ => {}
            }
        }
        (lower, upper)
    }

    /// Shard-key region this filter can match, used for targeting.
    pub fn key_bounds(&self, pattern: &ShardKeyPattern) -> KeyBounds {
        let mut per_field = Vec::with_capacity(pattern.fields.len());
        for field in &pattern.fields {
            per_field.push(self.equalities_on(field));
        }
        if per_field.iter().all(Option::is_some) {
            let mut points: Vec<Vec<KeyValue>> = vec![Vec::new()];
            for values in per_field.into_iter().flatten() {
                let mut next = Vec::with_capacity(points.len() * values.len());
                for prefix in &points {
                    for v in &values {
                        let mut p = prefix.clone();
                        p.push(v.clone());
                        next.push(p);
                    }
                }
                points = next;
            }
            let mut keys: Vec<ShardKey> = points
                .into_iter()
                .map(|vals| pattern.key_from_values(vals))
                .collect();
            keys.sort();
            keys.dedup();
            return KeyBounds::Points(keys);
        }
        if pattern.hashed {
            return KeyBounds::All;
        }
        let width = pattern.width();
        let first = &pattern.fields[0];
        if let Some(Some(prefix)) = self.equalities_on(first).map(|v| {
            if v.len() == 1 {
                v.into_iter().next()
            } else {
                None
            }
        }) {
            let mut lo = vec![prefix.clone()];
            lo.resize(width, KeyValue::MinKey);
            let mut hi = vec![prefix];
            hi.resize(width, KeyValue::MaxKey);
            return KeyBounds::Interval {
                lower: Bound::Included(ShardKey(lo)),
                upper: Bound::Included(ShardKey(hi)),
            };
        }
        let (lower, upper) = self.interval_on(first);
        if matches!((&lower, &upper), (Bound::Unbounded, Bound::Unbounded)) {
            return KeyBounds::All;
        }
        let pad = |k: KeyValue, fill: KeyValue| {
            let mut v = vec![k];
            v.resize(width, fill);
            ShardKey(v)
        };
        let lower = match lower {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(k) => Bound::Included(pad(k, KeyValue::MinKey)),
            Bound::Excluded(k) => Bound::Excluded(pad(k, KeyValue::MaxKey)),
        };
        let upper = match upper {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(k) => Bound::Included(pad(k, KeyValue::MaxKey)),
            Bound::Excluded(k) => Bound::Excluded(pad(k, KeyValue::MinKey)),
        };
        KeyBounds::Interval { lower, upper }
    }
}

fn tighter_lower(a: Bound<KeyValue>, b: Bound<KeyValue>) -> Bound<KeyValue> {
    match (&a, &b) {
        (Bound::Unbounded, _) => b,
        (_, Bound::Unbounded) => a,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            if y > x || (y == x && matches!(b, Bound::Excluded(_))) {
                b
            } else {
                a
            }
        }
    }
}

fn tighter_upper(a: Bound<KeyValue>, b: Bound<KeyValue>) -> Bound<KeyValue> {
    match (&a, &b) {
        (Bound::Unbounded, _) => b,
        (_, Bound::Unbounded) => a,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            if y < x || (y == x && matches!(b, Bound::Excluded(_))) {
                b
            } else {
                a
            }
        }
    }
}

fn eq_match(field: Option<&Value>, v: &Value) -> bool {
    match field {
        None => v.is_null(),
        Some(f) => compare_values(f, v) == Some(Ordering::Equal),
    }
}

fn cmp_match(field: Option<&Value>, v: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    field
        .and_then(|f| compare_values(f, v))
        .map(pred)
        .unwrap_or(false)
}

/// Compare two JSON values of the same type bracket. Mixed types never compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::Array(_), _) | (Value::Object(_), _) => (a == b).then_some(Ordering::Equal),
        _ => None,
    }
}
