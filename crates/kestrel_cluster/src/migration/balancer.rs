//! The balancer: splits oversized chunks and moves chunks from shards
//! holding more than their share of a collection's data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_common::config::BalancerConfig;
use kestrel_common::{KestrelResult, KeyRange, Namespace, ShardId};

use crate::catalog::{Chunk, CollectionRouting, ShardCatalog};
use crate::messages::ShardRequest;
use crate::transport::RpcClient;

/// Result of one balancing round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancerRoundReport {
    pub splits: usize,
    pub jumbo: usize,
    pub migrations: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct BalancerMetrics {
    rounds: AtomicU64,
    splits: AtomicU64,
    migrations: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct BalancerSnapshot {
    pub rounds: u64,
    pub splits: u64,
    pub migrations: u64,
    pub failed: u64,
}

/// A chunk picked to move this round.
#[derive(Debug, Clone)]
struct Move {
    ns: Namespace,
    chunk: Chunk,
    to: ShardId,
}

pub struct Balancer {
    catalog: Arc<ShardCatalog>,
    rpc: RpcClient,
    config: BalancerConfig,
    metrics: BalancerMetrics,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("enabled", &self.config.enabled)
            .field("rounds", &self.metrics.rounds.load(Ordering::Relaxed))
            .finish()
    }
}

impl Balancer {
    pub fn new(catalog: Arc<ShardCatalog>, rpc: RpcClient, config: BalancerConfig) -> Self {
        Self {
            catalog,
            rpc,
            config,
            metrics: BalancerMetrics::default(),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn snapshot(&self) -> BalancerSnapshot {
        BalancerSnapshot {
            rounds: self.metrics.rounds.load(Ordering::Relaxed),
            splits: self.metrics.splits.load(Ordering::Relaxed),
            migrations: self.metrics.migrations.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
        }
    }

    /// One pass over every sharded collection. A disabled balancer does
    /// nothing.
    pub fn run_round(&self) -> KestrelResult<BalancerRoundReport> {
        let mut report = BalancerRoundReport::default();
        if !self.config.enabled {
            return Ok(report);
        }
        self.catalog.reload_if_term_changed()?;
        let shards = self.catalog.list_shards();
        let draining: BTreeSet<ShardId> =
            shards.iter().filter(|s| s.draining).map(|s| s.id).collect();
        let active: BTreeSet<ShardId> =
            shards.iter().filter(|s| !s.draining).map(|s| s.id).collect();

        let mut busy: BTreeSet<ShardId> = BTreeSet::new();
        for routing in self.catalog.list_collections() {
            if routing.entry.resharding {
                continue;
            }
            let ns = routing.entry.ns.clone();
            let sizes = match self.chunk_sizes(&routing, &mut report) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(ns = %ns, error = %e, "chunk sizes unavailable, skipping");
                    continue;
                }
            };
            // Splits change the chunk table.
            let Some(routing) = self.catalog.get_collection(&ns) else {
                continue;
            };
            let Some(mv) = choose_move(
                &routing,
                &sizes,
                &active,
                &draining,
                &busy,
                self.config.max_chunk_size_bytes,
            ) else {
                continue;
            };
            busy.insert(mv.chunk.shard);
            busy.insert(mv.to);
            match self.execute(&routing, &mv) {
                Ok(()) => report.migrations += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        ns = %mv.ns,
                        range = %mv.chunk.range,
                        from = %mv.chunk.shard,
                        to = %mv.to,
                        error = %e,
                        "balancer migration failed",
                    );
                }
            }
        }

        self.metrics.rounds.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .splits
            .fetch_add(report.splits as u64, Ordering::Relaxed);
        self.metrics
            .migrations
            .fetch_add(report.migrations as u64, Ordering::Relaxed);
        self.metrics
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        kestrel_observability::record_balancer_round(report.migrations, report.splits);
        if report.splits + report.migrations + report.failed > 0 {
            tracing::info!(
                splits = report.splits,
                jumbo = report.jumbo,
                migrations = report.migrations,
                failed = report.failed,
                "balancer round finished"
            );
        }
        Ok(report)
    }

    /// Bytes per chunk as reported by its owner. With auto-split on,
    /// oversized chunks are split first (or marked jumbo when they have no
    /// split point) and the sizes describe the chunks before the split.
    fn chunk_sizes(
        &self,
        routing: &CollectionRouting,
        report: &mut BalancerRoundReport,
    ) -> KestrelResult<HashMap<KeyRange, u64>> {
        let ns = &routing.entry.ns;
        let max_bytes = if self.config.auto_split {
            self.config.max_chunk_size_bytes
        } else {
            u64::MAX
        };
        let mut sizes = HashMap::new();
        for chunk in routing.chunks.chunks() {
            let split = self
                .rpc
                .shard(
                    chunk.shard,
                    ShardRequest::SplitVector {
                        ns: ns.clone(),
                        range: chunk.range.clone(),
                        max_bytes,
                    },
                )?
                .into_split_points()?;
            sizes.insert(chunk.range.clone(), split.range_bytes);
            if !self.config.auto_split || chunk.jumbo || split.range_bytes <= max_bytes {
                continue;
            }
            if split.points.is_empty() {
                self.catalog.mark_jumbo(ns, &chunk.range)?;
                report.jumbo += 1;
                tracing::info!(
                    ns = %ns,
                    range = %chunk.range,
                    bytes = split.range_bytes,
                    "chunk marked jumbo",
                );
                continue;
            }
            for point in &split.points {
                self.catalog.split_chunk(ns, point)?;
                report.splits += 1;
            }
            tracing::debug!(
                ns = %ns,
                range = %chunk.range,
                points = split.points.len(),
                "chunk split",
            );
        }
        Ok(sizes)
    }

    fn execute(&self, routing: &CollectionRouting, mv: &Move) -> KestrelResult<()> {
        let outcome = self
            .rpc
            .shard(
                mv.chunk.shard,
                ShardRequest::MoveRange {
                    ns: mv.ns.clone(),
                    range: mv.chunk.range.clone(),
                    to: mv.to,
                    epoch: routing.epoch(),
                },
            )?
            .into_migrated()?;
        self.catalog.reload()?;
        tracing::info!(
            ns = %mv.ns,
            range = %mv.chunk.range,
            from = %mv.chunk.shard,
            to = %mv.to,
            docs = outcome.docs_cloned,
            "balancer moved chunk",
        );
        Ok(())
    }
}

/// Pick at most one chunk of `routing` to move. Draining shards donate
/// first; otherwise the fullest shard donates when it holds at least one
/// maximum chunk size above the average.
fn choose_move(
    routing: &CollectionRouting,
    sizes: &HashMap<KeyRange, u64>,
    active: &BTreeSet<ShardId>,
    draining: &BTreeSet<ShardId>,
    busy: &BTreeSet<ShardId>,
    max_chunk_bytes: u64,
) -> Option<Move> {
    let size_of = |c: &Chunk| sizes.get(&c.range).copied().unwrap_or(0);
    let mut load: BTreeMap<ShardId, u64> = active.iter().map(|s| (*s, 0)).collect();
    for chunk in routing.chunks.chunks() {
        if active.contains(&chunk.shard) {
            *load.entry(chunk.shard).or_default() += size_of(chunk);
        }
    }
    let recipient = |exclude: ShardId| {
        load.iter()
            .filter(|(s, _)| **s != exclude && !busy.contains(s))
            .min_by_key(|(s, bytes)| (**bytes, **s))
            .map(|(s, _)| *s)
    };
    let ns = routing.entry.ns.clone();

    for &from in draining.iter().filter(|s| !busy.contains(s)) {
        let Some(chunk) = routing
            .chunks
            .chunks_on(from)
            .into_iter()
            .find(|c| !c.jumbo)
        else {
            continue;
        };
        let to = recipient(from)?;
        return Some(Move {
            ns,
            chunk: chunk.clone(),
            to,
        });
    }

    if load.len() < 2 {
        return None;
    }
    let total: u64 = load.values().sum();
    let ideal = total / load.len() as u64;
    let (&from, &from_bytes) = load
        .iter()
        .filter(|(s, _)| !busy.contains(s))
        .max_by_key(|(s, bytes)| (**bytes, std::cmp::Reverse(**s)))?;
    if from_bytes < ideal.saturating_add(max_chunk_bytes) {
        return None;
    }
    let to = recipient(from)?;
    let gap = from_bytes.saturating_sub(load.get(&to).copied().unwrap_or(0));
    // The largest chunk that narrows the gap without reversing it.
    let chunk = routing
        .chunks
        .chunks_on(from)
        .into_iter()
        .filter(|c| !c.jumbo && size_of(c) > 0 && size_of(c) < gap)
        .max_by_key(|c| size_of(c))?;
    Some(Move {
        ns,
        chunk: chunk.clone(),
        to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChunkMap, CollectionEntry};
    use kestrel_common::{CollectionUuid, KeyValue, ShardKey, ShardKeyPattern};

    fn routing_with(splits: &[i64], owners: &[u64]) -> CollectionRouting {
        let ns = Namespace::new("app", "orders");
        let pattern = ShardKeyPattern::ranged(&["k"]);
        let mut chunks = ChunkMap::single(ns.clone(), pattern.clone(), ShardId(owners[0]));
        for &s in splits {
            chunks.split(&ShardKey::single(KeyValue::Int(s))).unwrap();
        }
        let ranges: Vec<KeyRange> = chunks.chunks().iter().map(|c| c.range.clone()).collect();
        for (range, &owner) in ranges.iter().zip(owners) {
            if ShardId(owner) != ShardId(owners[0]) {
                chunks.move_chunk(range, ShardId(owner)).unwrap();
            }
        }
        CollectionRouting {
            entry: CollectionEntry {
                ns,
                uuid: CollectionUuid::generate(),
                key_pattern: pattern,
                unique: false,
                resharding: false,
            },
            chunks,
        }
    }

    fn shards(ids: &[u64]) -> BTreeSet<ShardId> {
        ids.iter().map(|i| ShardId(*i)).collect()
    }

    #[test]
    fn test_moves_largest_fitting_chunk_off_fullest_shard() {
        let r = routing_with(&[10, 20], &[0, 0, 1]);
        let ranges: Vec<KeyRange> = r.chunks.chunks().iter().map(|c| c.range.clone()).collect();
        let sizes: HashMap<KeyRange, u64> =
            [(ranges[0].clone(), 400), (ranges[1].clone(), 300), (ranges[2].clone(), 0)].into();
        let mv = choose_move(&r, &sizes, &shards(&[0, 1]), &BTreeSet::new(), &BTreeSet::new(), 100)
            .unwrap();
        assert_eq!(mv.chunk.range, ranges[0]);
        assert_eq!(mv.chunk.shard, ShardId(0));
        assert_eq!(mv.to, ShardId(1));
    }

    #[test]
    fn test_balanced_collection_stays_put() {
        let r = routing_with(&[10], &[0, 1]);
        let ranges: Vec<KeyRange> = r.chunks.chunks().iter().map(|c| c.range.clone()).collect();
        let sizes: HashMap<KeyRange, u64> =
            [(ranges[0].clone(), 250), (ranges[1].clone(), 200)].into();
        assert!(choose_move(&r, &sizes, &shards(&[0, 1]), &BTreeSet::new(), &BTreeSet::new(), 100)
            .is_none());
    }

    #[test]
    fn test_draining_shard_donates_even_empty_chunks() {
        let r = routing_with(&[10], &[0, 1]);
        let mv = choose_move(
            &r,
            &HashMap::new(),
            &shards(&[0]),
            &shards(&[1]),
            &BTreeSet::new(),
            100,
        )
        .unwrap();
        assert_eq!(mv.chunk.shard, ShardId(1));
        assert_eq!(mv.to, ShardId(0));
    }

    #[test]
    fn test_busy_shards_are_skipped() {
        let r = routing_with(&[10, 20], &[0, 0, 1]);
        let ranges: Vec<KeyRange> = r.chunks.chunks().iter().map(|c| c.range.clone()).collect();
        let sizes: HashMap<KeyRange, u64> =
            [(ranges[0].clone(), 400), (ranges[1].clone(), 300)].into();
        assert!(choose_move(&r, &sizes, &shards(&[0, 1]), &BTreeSet::new(), &shards(&[0]), 100)
            .is_none());
    }

    #[test]
    fn test_jumbo_chunks_never_move() {
        let mut r = routing_with(&[10], &[0, 0]);
        let ranges: Vec<KeyRange> = r.chunks.chunks().iter().map(|c| c.range.clone()).collect();
        r.chunks.mark_jumbo(&ranges[0]).unwrap();
        r.chunks.mark_jumbo(&ranges[1]).unwrap();
        let sizes: HashMap<KeyRange, u64> =
            [(ranges[0].clone(), 900), (ranges[1].clone(), 900)].into();
        assert!(choose_move(&r, &sizes, &shards(&[0, 1]), &BTreeSet::new(), &BTreeSet::new(), 100)
            .is_none());
    }
}
