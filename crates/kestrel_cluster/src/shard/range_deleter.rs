//! Deferred deletion of ranges a shard has migrated away.
//!
//! After a migration commits, the donor still holds a copy of the moved
//! documents. They are orphans: filtered out of every read, and deleted here
//! once the cleanup delay has passed. Tasks are persisted in
//! `config.rangeDeletions` on the shard itself so a new primary resumes them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::{
    CollectionUuid, DocKey, KestrelResult, KeyRange, Namespace, ShardId, ShardKeyPattern,
    WriteConcern,
};
use kestrel_repl::{CrudOp, OplogDraft, OplogOp, ReplicaSet};
use kestrel_storage::StorageNode;

use super::metadata::ShardMetadata;
use crate::durable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    /// Id of the migration that orphaned the range.
    pub id: String,
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub range: KeyRange,
    pub pattern: ShardKeyPattern,
}

pub fn range_deletions_ns() -> Namespace {
    Namespace::new("config", "rangeDeletions")
}

#[derive(Debug, Default)]
struct DeleterMetrics {
    scheduled: AtomicU64,
    completed: AtomicU64,
    docs_deleted: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct RangeDeleterSnapshot {
    pub pending: usize,
    pub scheduled: u64,
    pub completed: u64,
    pub docs_deleted: u64,
}

#[derive(Debug)]
pub struct RangeDeleter {
    shard: ShardId,
    delay: Duration,
    batch_size: usize,
    pending: Mutex<BTreeMap<String, (RangeDeletionTask, Instant)>>,
    metrics: DeleterMetrics,
}

impl RangeDeleter {
    pub fn new(shard: ShardId, delay: Duration, batch_size: usize) -> Self {
        Self {
            shard,
            delay,
            batch_size: batch_size.max(1),
            pending: Mutex::new(BTreeMap::new()),
            metrics: DeleterMetrics::default(),
        }
    }

    /// Persist `task` and queue it behind the cleanup delay.
    pub fn schedule(&self, rs: &ReplicaSet, task: RangeDeletionTask) -> KestrelResult<()> {
        rs.write_with_concern(WriteConcern::Majority, |w| {
            durable::log_put(w, &range_deletions_ns(), &task.id, &task)
        })?;
        tracing::info!(
            shard = %self.shard,
            ns = %task.ns,
            range = %task.range,
            delay_ms = self.delay.as_millis() as u64,
            "range deletion scheduled"
        );
        self.pending
            .lock()
            .insert(task.id.clone(), (task, Instant::now() + self.delay));
        self.metrics.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the queue with the tasks persisted on `storage`, all due now.
    pub fn recover(&self, storage: &StorageNode) -> KestrelResult<usize> {
        let tasks: Vec<RangeDeletionTask> = durable::load(storage, &range_deletions_ns())?;
        let now = Instant::now();
        let mut pending = self.pending.lock();
        pending.clear();
        for t in tasks {
            pending.insert(t.id.clone(), (t, now));
        }
        if !pending.is_empty() {
            tracing::info!(shard = %self.shard, tasks = pending.len(), "range deletions recovered");
        }
        Ok(pending.len())
    }

    pub fn pending(&self) -> Vec<RangeDeletionTask> {
        self.pending.lock().values().map(|(t, _)| t.clone()).collect()
    }

    /// Namespaces with at least one task due now.
    pub fn due_namespaces(&self) -> Vec<Namespace> {
        let now = Instant::now();
        let mut out: Vec<Namespace> = self
            .pending
            .lock()
            .values()
            .filter(|(_, due)| *due <= now)
            .map(|(t, _)| t.ns.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Run every due task. Returns documents deleted.
    pub fn run_due(&self, rs: &ReplicaSet, metadata: &ShardMetadata) -> KestrelResult<u64> {
        let now = Instant::now();
        let due: Vec<RangeDeletionTask> = self
            .pending
            .lock()
            .values()
            .filter(|(_, d)| *d <= now)
            .map(|(t, _)| t.clone())
            .collect();
        let mut deleted = 0;
        for task in due {
            deleted += self.run_task(rs, metadata, &task)?;
        }
        Ok(deleted)
    }

    /// Run tasks overlapping `range` immediately, whatever their delay.
    /// A recipient does this before cloning a range back in.
    pub fn flush_overlapping(
        &self,
        rs: &ReplicaSet,
        metadata: &ShardMetadata,
        ns: &Namespace,
        range: &KeyRange,
    ) -> KestrelResult<u64> {
        let overlapping: Vec<RangeDeletionTask> = self
            .pending
            .lock()
            .values()
            .filter(|(t, _)| t.ns == *ns && t.range.intersects(range))
            .map(|(t, _)| t.clone())
            .collect();
        let mut deleted = 0;
        for task in overlapping {
            deleted += self.run_task(rs, metadata, &task)?;
        }
        Ok(deleted)
    }

    /// Forget tasks of a dropped collection.
    pub fn cancel_for(&self, rs: &ReplicaSet, ns: &Namespace) -> KestrelResult<usize> {
        let ids: Vec<String> = self
            .pending
            .lock()
            .values()
            .filter(|(t, _)| t.ns == *ns)
            .map(|(t, _)| t.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        rs.write_with_concern(WriteConcern::Majority, |w| {
            for id in &ids {
                durable::log_delete(w, &range_deletions_ns(), id)?;
            }
            Ok(())
        })?;
        let mut pending = self.pending.lock();
        for id in &ids {
            pending.remove(id);
        }
        Ok(ids.len())
    }

    fn run_task(
        &self,
        rs: &ReplicaSet,
        metadata: &ShardMetadata,
        task: &RangeDeletionTask,
    ) -> KestrelResult<u64> {
        // Without filtering metadata the shard cannot tell orphans from owned
        // documents; the caller refreshes and the task runs next round.
        let Some(filter) = metadata.collection(&task.ns) else {
            return Ok(0);
        };
        let mut deleted = 0u64;
        loop {
            let n = rs.write_with_concern(WriteConcern::Majority, |w| {
                let same_incarnation = w
                    .storage()
                    .collection_info(&task.ns)
                    .is_some_and(|i| i.uuid == task.uuid);
                if !same_incarnation {
                    return Ok(0);
                }
                let orphans = w.storage().scan_latest_where(&task.ns, |d| {
                    task.pattern
                        .extract(d)
                        .is_some_and(|k| {
                            task.range.contains(&k) && !filter.owns_key(self.shard, &k)
                        })
                });
                let mut n = 0;
                for doc in orphans.into_iter().take(self.batch_size) {
                    let doc_key = DocKey::of(&doc)?;
                    w.log(
                        OplogDraft::new(
                            task.ns.clone(),
                            Some(task.uuid),
                            OplogOp::Crud(CrudOp::Delete { doc_key }),
                        )
                        .from_migrate(),
                    )?;
                    n += 1;
                }
                Ok(n)
            })?;
            deleted += n;
            if n < self.batch_size as u64 {
                break;
            }
        }
        rs.write_with_concern(WriteConcern::Majority, |w| {
            durable::log_delete(w, &range_deletions_ns(), &task.id)
        })?;
        self.pending.lock().remove(&task.id);
        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
        self.metrics.docs_deleted.fetch_add(deleted, Ordering::Relaxed);
        kestrel_observability::record_orphans_deleted(deleted);
        tracing::info!(
            shard = %self.shard,
            ns = %task.ns,
            range = %task.range,
            deleted,
            "range deletion finished",
        );
        Ok(deleted)
    }

    pub fn snapshot(&self) -> RangeDeleterSnapshot {
        RangeDeleterSnapshot {
            pending: self.pending.lock().len(),
            scheduled: self.metrics.scheduled.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            docs_deleted: self.metrics.docs_deleted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{ChunkMap, CollectionEntry, CollectionRouting, RoutingUpdate};
    use kestrel_common::config::{ReplicationConfig, StorageConfig};
    use kestrel_common::{ClusterClock, ManualWallClock, ShardKey};
    use kestrel_storage::CollectionOptions;
    use serde_json::json;

    #[test]
    fn test_deletes_only_orphans_and_survives_restart() {
        let rs = ReplicaSet::new(
            "shard0",
            1,
            ClusterClock::new(ManualWallClock::new(10)),
            ReplicationConfig::default(),
            StorageConfig::default(),
        )
        .unwrap();
        let ns = Namespace::new("app", "events");
        let uuid = CollectionUuid::generate();
        rs.write_with_concern(WriteConcern::Majority, |w| {
            w.log(OplogDraft::new(
                ns.clone(),
                Some(uuid),
                OplogOp::Create { options: CollectionOptions::default() },
            ))?;
            for k in 0..10 {
                let doc = json!({"_id": k, "k": k}).as_object().cloned().unwrap();
                w.log(
                    OplogDraft::new(ns.clone(), Some(uuid), OplogOp::Crud(CrudOp::Insert { doc })),
                )?;
            }
            Ok(())
        })
        .unwrap();

        let pattern = ShardKeyPattern::ranged(&["k"]);
        let mut chunks = ChunkMap::single(ns.clone(), pattern.clone(), ShardId(0));
        let (_, upper) = chunks.split(&ShardKey::single(5)).unwrap();
        chunks.move_chunk(&upper.range, ShardId(1)).unwrap();
        let metadata = ShardMetadata::new(ShardId(0));
        metadata
            .install_collection(
                &ns,
                RoutingUpdate::Full(CollectionRouting {
                    entry: CollectionEntry {
                        ns: ns.clone(),
                        uuid,
                        key_pattern: pattern.clone(),
                        unique: false,
                        resharding: false,
                    },
                    chunks,
                }),
            )
            .unwrap();

        let deleter = RangeDeleter::new(ShardId(0), Duration::from_secs(3600), 2);
        deleter
            .schedule(
                &rs,
                RangeDeletionTask {
                    id: "m1".into(),
                    ns: ns.clone(),
                    uuid,
                    range: upper.range.clone(),
                    pattern,
                },
            )
            .unwrap();
        assert_eq!(deleter.run_due(&rs, &metadata).unwrap(), 0);

        let restarted = Arc::new(RangeDeleter::new(ShardId(0), Duration::ZERO, 2));
        assert_eq!(restarted.recover(&rs.primary_storage().unwrap()).unwrap(), 1);
        assert_eq!(restarted.due_namespaces(), vec![ns.clone()]);
        assert_eq!(restarted.run_due(&rs, &metadata).unwrap(), 5);
        let storage = rs.primary_storage().unwrap();
        assert_eq!(storage.count_latest(&ns), 5);
        assert!(restarted.pending().is_empty());
        assert!(durable::load::<RangeDeletionTask>(&storage, &range_deletions_ns())
            .unwrap()
            .is_empty());
    }
}
