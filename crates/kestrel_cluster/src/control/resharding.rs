//! Resharding: rewrite a sharded collection under a new shard key.
//!
//! Writes to the collection are blocked on every shard involved for the
//! whole operation. The documents are collected from their current owners,
//! redistributed under the new key into a fresh collection incarnation, and
//! the catalog then switches to the new uuid, key and epoch at once. A
//! failure before the catalog commit puts every shard back on the old
//! incarnation with its old documents.

use std::collections::{BTreeMap, BTreeSet};

use kestrel_common::{
    CollectionUuid, Document, KestrelError, KestrelResult, KeyRange, Namespace, ShardId, ShardKey,
    ShardKeyPattern,
};

use super::ddl::collection_reply;
use super::topology::mismatch;
use super::{ClusterCommand, ClusterControl, CommandReply};
use crate::catalog::{ChunkMap, CollectionRouting};
use crate::messages::ShardRequest;
use crate::shard::CriticalScope;

pub(super) fn reshard_collection(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::ReshardCollection { ns, key } = cmd else {
        return Err(mismatch(&cmd));
    };
    if key.fields.is_empty() {
        return Err(KestrelError::BadValue("shard key must name at least one field".into()));
    }
    let old = ctl.catalog.begin_reshard(&ns)?;
    if old.entry.unique && key.hashed {
        ctl.catalog.abort_reshard(&ns)?;
        return Err(KestrelError::BadValue("hashed shard keys cannot be unique".into()));
    }
    let primary = match ctl.require_database(&ns.db) {
        Ok(db) => db.primary,
        Err(e) => {
            ctl.catalog.abort_reshard(&ns)?;
            return Err(e);
        }
    };
    let active: Vec<ShardId> = ctl
        .catalog
        .list_shards()
        .into_iter()
        .filter(|s| !s.draining)
        .map(|s| s.id)
        .collect();
    let mut involved: BTreeSet<ShardId> = old.chunks.shards();
    involved.extend(active.iter().copied());
    involved.insert(primary);
    let involved: Vec<ShardId> = involved.into_iter().collect();

    let scope = CriticalScope::Collection(ns.clone());
    if let Err(e) = ctl.enter_critical(&involved, &scope, "reshardCollection") {
        ctl.exit_critical(&involved, &scope);
        ctl.catalog.abort_reshard(&ns)?;
        return Err(e);
    }

    let mut job = ReshardJob {
        ctl,
        ns: &ns,
        old: &old,
        key: &key,
        primary,
        active: &active,
        involved: &involved,
        snapshot: BTreeMap::new(),
        touched: Vec::new(),
    };
    let outcome = job.run();
    match outcome {
        Ok(routing) => {
            ctl.refresh_collection_on(&involved, &ns);
            ctl.exit_critical(&involved, &scope);
            Ok(collection_reply(&routing))
        }
        Err(e) => {
            tracing::warn!(
                ns = %ns,
                key = %key,
                error = %e,
                "reshard failed, restoring previous incarnation",
            );
            job.restore();
            let aborted = ctl.catalog.abort_reshard(&ns);
            ctl.refresh_collection_on(&involved, &ns);
            ctl.exit_critical(&involved, &scope);
            aborted?;
            Err(e)
        }
    }
}

struct ReshardJob<'a> {
    ctl: &'a ClusterControl,
    ns: &'a Namespace,
    old: &'a CollectionRouting,
    key: &'a ShardKeyPattern,
    primary: ShardId,
    active: &'a [ShardId],
    involved: &'a [ShardId],
    /// Documents each old owner held, for rollback.
    snapshot: BTreeMap<ShardId, Vec<Document>>,
    /// Shards sent the new incarnation, including a failed attempt.
    touched: Vec<ShardId>,
}

impl ReshardJob<'_> {
    fn run(&mut self) -> KestrelResult<CollectionRouting> {
        for shard in self.old.chunks.shards() {
            let docs = self
                .ctl
                .send(shard, ShardRequest::DumpCollection { ns: self.ns.clone() })?
                .into_docs()?;
            self.snapshot.insert(shard, docs);
        }
        let docs: Vec<&Document> = self.snapshot.values().flatten().collect();
        let placement = plan_placement(self.ns, self.key, &docs, self.active, self.primary)?;

        let mut per_shard: BTreeMap<ShardId, Vec<Document>> = BTreeMap::new();
        for doc in docs {
            let k = self.key.extract(doc).ok_or_else(|| {
                KestrelError::BadValue(format!(
                    "a document in {} has no usable value for shard key {}",
                    self.ns, self.key
                ))
            })?;
            let owner = placement
                .iter()
                .find(|(range, _)| range.contains(&k))
                .map(|(_, shard)| *shard)
                .ok_or_else(|| {
                    KestrelError::internal_bug(
                        "E-RESHARD-001",
                        "placement does not cover key",
                        k.to_string(),
                    )
                })?;
            per_shard.entry(owner).or_default().push(doc.clone());
        }

        let new_uuid = CollectionUuid::generate();
        for &shard in self.involved {
            self.touched.push(shard);
            self.ctl
                .send(
                    shard,
                    ShardRequest::ReshardInstall {
                        ns: self.ns.clone(),
                        new_uuid,
                        key_pattern: self.key.clone(),
                        docs: per_shard.remove(&shard).unwrap_or_default(),
                        announce: shard == self.primary,
                    },
                )?
                .into_ok()?;
        }
        let routing = self
            .ctl
            .catalog
            .commit_reshard(self.ns, new_uuid, self.key.clone(), placement)?;
        tracing::info!(
            ns = %self.ns,
            key = %self.key,
            uuid = %new_uuid,
            chunks = routing.chunks.len(),
            "collection resharded"
        );
        Ok(routing)
    }

    /// Reinstall the old incarnation wherever the new one may have landed.
    fn restore(&mut self) {
        for &shard in &self.touched {
            let docs = self.snapshot.remove(&shard).unwrap_or_default();
            let req = ShardRequest::ReshardInstall {
                ns: self.ns.clone(),
                new_uuid: self.old.entry.uuid,
                key_pattern: self.old.entry.key_pattern.clone(),
                docs,
                announce: false,
            };
            if let Err(e) = self.ctl.send(shard, req) {
                tracing::error!(
                    ns = %self.ns,
                    shard = %shard,
                    error = %e,
                    "old incarnation not restored",
                );
            }
        }
    }
}

/// Ranges of the new key space and their owners.
///
/// Hashed keys are split evenly. Ranged keys are split at quantiles of the
/// keys actually present, so each active shard receives about the same
/// number of documents; an empty collection gets one chunk on the primary.
fn plan_placement(
    ns: &Namespace,
    key: &ShardKeyPattern,
    docs: &[&Document],
    active: &[ShardId],
    primary: ShardId,
) -> KestrelResult<Vec<(KeyRange, ShardId)>> {
    if active.is_empty() {
        return Err(KestrelError::IllegalOperation("no shards available".into()));
    }
    if key.hashed {
        let map = ChunkMap::presplit_hashed(ns.clone(), key.clone(), active, 1)?;
        return Ok(map
            .chunks()
            .iter()
            .map(|c| (c.range.clone(), c.shard))
            .collect());
    }
    let mut keys: Vec<ShardKey> = docs.iter().filter_map(|d| key.extract(d)).collect();
    keys.sort();
    keys.dedup();
    let full = key.full_range();
    if keys.len() < 2 || active.len() == 1 {
        let owner = if active.contains(&primary) { primary } else { active[0] };
        return Ok(vec![(full, owner)]);
    }
    let pieces = active.len().min(keys.len());
    let mut bounds = vec![full.min.clone()];
    for i in 1..pieces {
        let point = keys[i * keys.len() / pieces].clone();
        if bounds.last() != Some(&point) {
            bounds.push(point);
        }
    }
    bounds.push(full.max);
    Ok(bounds
        .windows(2)
        .enumerate()
        .map(|(i, w)| (KeyRange::new(w[0].clone(), w[1].clone()), active[i % active.len()]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(n: i64) -> Vec<Document> {
        (0..n)
            .map(|i| serde_json::from_value(json!({"_id": i, "region": i * 10})).unwrap())
            .collect()
    }

    #[test]
    fn test_ranged_placement_splits_at_quantiles() {
        let ns = Namespace::new("app", "events");
        let key = ShardKeyPattern::ranged(&["region"]);
        let owned = docs(9);
        let refs: Vec<&Document> = owned.iter().collect();
        let shards = [ShardId(1), ShardId(2), ShardId(3)];
        let placement = plan_placement(&ns, &key, &refs, &shards, ShardId(1)).unwrap();
        assert_eq!(placement.len(), 3);
        assert!(placement[0].0.min.is_global_min());
        assert!(placement[2].0.max.is_global_max());
        for pair in placement.windows(2) {
            assert_eq!(pair[0].0.max, pair[1].0.min);
        }
        let shard_of = |v: i64| {
            let k = ShardKey::single(kestrel_common::KeyValue::Int(v));
            placement.iter().find(|(r, _)| r.contains(&k)).unwrap().1
        };
        assert_eq!(shard_of(0), ShardId(1));
        assert_eq!(shard_of(40), ShardId(2));
        assert_eq!(shard_of(80), ShardId(3));
    }

    #[test]
    fn test_empty_collection_lands_on_primary() {
        let ns = Namespace::new("app", "events");
        let key = ShardKeyPattern::ranged(&["region"]);
        let placement = plan_placement(
            &ns,
            &key,
            &[],
            &[ShardId(1), ShardId(2)],
            ShardId(2),
        ).unwrap();
        assert_eq!(placement, vec![(key.full_range(), ShardId(2))]);
    }

    #[test]
    fn test_hashed_placement_covers_every_shard() {
        let ns = Namespace::new("app", "events");
        let key = ShardKeyPattern::hashed("region");
        let placement =
            plan_placement(&ns, &key, &[], &[ShardId(1), ShardId(2)], ShardId(1)).unwrap();
        let owners: BTreeSet<ShardId> = placement.iter().map(|(_, s)| *s).collect();
        assert_eq!(owners, BTreeSet::from([ShardId(1), ShardId(2)]));
    }
}
