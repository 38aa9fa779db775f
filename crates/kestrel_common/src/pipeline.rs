//! Pipeline executor seam.
//!
//! Query and aggregation evaluation is an external collaborator: the core
//! feeds it documents (a storage scan or change events) and forwards whatever
//! it returns. `MatchLimitExecutor` understands `$match` and `$limit` only,
//! which is enough for routing-level use and tests.

use serde_json::Value;

use crate::document::Document;
use crate::error::{KestrelError, KestrelResult};
use crate::filter::Filter;

/// An opaque aggregation pipeline: a list of stage documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Value>,
}

impl Pipeline {
    pub fn new(stages: Vec<Value>) -> Self {
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub trait PipelineExecutor: Send + Sync {
    fn execute(&self, pipeline: &Pipeline, input: Vec<Document>) -> KestrelResult<Vec<Document>>;
}

/// Returns its input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughExecutor;

impl PipelineExecutor for PassthroughExecutor {
    fn execute(&self, _: &Pipeline, input: Vec<Document>) -> KestrelResult<Vec<Document>> {
        Ok(input)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MatchLimitExecutor;

impl PipelineExecutor for MatchLimitExecutor {
    fn execute(&self, pipeline: &Pipeline, input: Vec<Document>) -> KestrelResult<Vec<Document>> {
        let mut docs = input;
        for stage in &pipeline.stages {
            let (name, arg) = stage
                .as_object()
                .and_then(|o| o.iter().next())
                .ok_or_else(|| KestrelError::BadValue(format!("malformed stage {stage}")))?;
            match name.as_str() {
                "$match" => {
                    let filter = Filter::parse(arg)?;
                    docs.retain(|d| filter.matches(d));
                }
                "$limit" => {
                    let n = arg
                        .as_u64()
                        .ok_or_else(|| KestrelError::BadValue("$limit needs a number".into()))?;
                    docs.truncate(n as usize);
                }
                other => {
                    return Err(KestrelError::IllegalOperation(format!(
                        "stage {other} is not supported by this executor"
                    )))
                }
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_match_then_limit() {
        let input: Vec<Document> = (0..10)
            .map(|i| json!({"_id": i, "even": i % 2 == 0}).as_object().cloned().unwrap())
            .collect();
        let p = Pipeline::new(vec![json!({"$match": {"even": true}}), json!({"$limit": 2})]);
        let out = MatchLimitExecutor.execute(&p, input).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].get("_id"), Some(&json!(2)));
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let p = Pipeline::new(vec![json!({"$group": {}})]);
        assert!(MatchLimitExecutor.execute(&p, vec![]).is_err());
    }
}
