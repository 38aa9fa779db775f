//! Registry of long-running cluster commands.
//!
//! Bounded: once full, the oldest finished operation is evicted first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::KestrelResult;

use super::{CommandKind, CommandReply};

pub type OperationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationState {
    Running,
    Succeeded(Box<CommandReply>),
    Failed { code: i32, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: OperationId,
    pub kind: CommandKind,
    pub description: String,
    pub state: OperationState,
    /// Wall-clock milliseconds since the epoch.
    pub started_ms: u64,
    pub finished_ms: Option<u64>,
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, OperationState::Running)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
pub struct OperationRegistry {
    ops: Mutex<VecDeque<OperationStatus>>,
    max_ops: usize,
    next_id: AtomicU64,
}

impl OperationRegistry {
    pub fn new(max_ops: usize) -> Self {
        Self {
            ops: Mutex::new(VecDeque::with_capacity(max_ops)),
            max_ops: max_ops.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn begin(&self, kind: CommandKind, description: impl Into<String>) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status = OperationStatus {
            id,
            kind,
            description: description.into(),
            state: OperationState::Running,
            started_ms: now_ms(),
            finished_ms: None,
        };
        tracing::info!(
            op = id,
            kind = kind.name(),
            description = %status.description,
            "cluster operation started",
        );
        let mut ops = self.ops.lock();
        if ops.len() >= self.max_ops {
            match ops.iter().position(OperationStatus::is_finished) {
                Some(idx) => {
                    ops.remove(idx);
                }
                None => {
                    ops.pop_front();
                }
            }
        }
        ops.push_back(status);
        id
    }

    pub fn finish(&self, id: OperationId, result: &KestrelResult<CommandReply>) {
        let mut ops = self.ops.lock();
        let Some(op) = ops.iter_mut().find(|o| o.id == id) else {
            return;
        };
        op.finished_ms = Some(now_ms());
        op.state = match result {
            Ok(reply) => OperationState::Succeeded(Box::new(reply.clone())),
            Err(e) => OperationState::Failed {
                code: e.code(),
                message: e.to_string(),
            },
        };
        match &op.state {
            OperationState::Failed { message, .. } => {
                tracing::warn!(
                    op = id,
                    kind = op.kind.name(),
                    error = %message,
                    "cluster operation failed",
                )
            }
            _ => tracing::info!(op = id, kind = op.kind.name(), "cluster operation finished"),
        }
    }

    pub fn get(&self, id: OperationId) -> Option<OperationStatus> {
        self.ops.lock().iter().find(|o| o.id == id).cloned()
    }

    pub fn running(&self) -> Vec<OperationStatus> {
        self.ops
            .lock()
            .iter()
            .filter(|o| !o.is_finished())
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<OperationStatus> {
        self.ops.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::KestrelError;

    #[test]
    fn test_operation_lifecycle() {
        let reg = OperationRegistry::new(8);
        let id = reg.begin(CommandKind::MoveChunk, "app.users [0, 10) -> shard2");
        assert_eq!(reg.running().len(), 1);
        reg.finish(id, &Ok(CommandReply::Ok));
        let op = reg.get(id).unwrap();
        assert!(op.is_finished());
        assert_eq!(op.state, OperationState::Succeeded(Box::new(CommandReply::Ok)));
        assert!(op.finished_ms.is_some());
    }

    #[test]
    fn test_failed_operation_keeps_error_code() {
        let reg = OperationRegistry::new(8);
        let id = reg.begin(CommandKind::RemoveShard, "shard3");
        reg.finish(id, &Err(KestrelError::BadValue("nope".into())));
        match reg.get(id).unwrap().state {
            OperationState::Failed { code, .. } => assert_eq!(code, 2),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_eviction_prefers_finished_operations() {
        let reg = OperationRegistry::new(2);
        let running = reg.begin(CommandKind::ReshardCollection, "a");
        let done = reg.begin(CommandKind::MoveChunk, "b");
        reg.finish(done, &Ok(CommandReply::Ok));
        let third = reg.begin(CommandKind::MoveChunk, "c");
        assert!(reg.get(running).is_some());
        assert!(reg.get(done).is_none());
        assert!(reg.get(third).is_some());
    }
}
