//! Chunk maps: the ordered partition of a sharded collection's key space.
//!
//! Every mutation bumps versions so that a reader holding an older map can
//! fetch just the chunks that changed (`changed_since`) and splice them in
//! (`apply_changes`). A map that fails its partition check is never used for
//! routing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use kestrel_common::error::ShardingError;
use kestrel_common::shard_key::KeyBounds;
use kestrel_common::{
    ChunkVersion, Epoch, KestrelResult, KeyRange, KeyValue, Namespace, ShardId, ShardKey,
    ShardKeyPattern,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range: KeyRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    /// Too large to move and impossible to split.
    pub jumbo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMap {
    ns: Namespace,
    epoch: Epoch,
    pattern: ShardKeyPattern,
    /// Sorted by `range.min`.
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    pub fn new(
        ns: Namespace,
        epoch: Epoch,
        pattern: ShardKeyPattern,
        mut chunks: Vec<Chunk>,
    ) -> KestrelResult<Self> {
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let map = Self {
            ns,
            epoch,
            pattern,
            chunks,
        };
        map.validate()?;
        Ok(map)
    }

    /// One chunk covering the whole key space.
    pub fn single(ns: Namespace, pattern: ShardKeyPattern, shard: ShardId) -> Self {
        let epoch = Epoch::generate();
        let chunk = Chunk {
            range: pattern.full_range(),
            shard,
            version: ChunkVersion::new(epoch, 1, 0),
            jumbo: false,
        };
        Self {
            ns,
            epoch,
            pattern,
            chunks: vec![chunk],
        }
    }

    /// Evenly pre-split hashed key space, dealt round-robin over `shards`.
    pub fn presplit_hashed(
        ns: Namespace,
        pattern: ShardKeyPattern,
        shards: &[ShardId],
        chunks_per_shard: usize,
    ) -> KestrelResult<Self> {
        if !pattern.hashed || pattern.width() != 1 {
            return Err(ShardingError::InvalidChunkOperation(
                "pre-splitting requires a single hashed field".into(),
            )
            .into());
        }
        if shards.is_empty() {
            return Err(
                ShardingError::InvalidChunkOperation("no shards to place chunks on".into()).into(),
            );
        }
        let epoch = Epoch::generate();
        let n = (shards.len() * chunks_per_shard.max(1)) as i128;
        let span: i128 = 1 << 64;
        let mut bounds = vec![ShardKey::global_min(1)];
        for i in 1..n {
            let point = i64::MIN as i128 + span * i / n;
            bounds.push(ShardKey::single(KeyValue::Int(point as i64)));
        }
        bounds.push(ShardKey::global_max(1));
        let chunks = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| Chunk {
                range: KeyRange::new(w[0].clone(), w[1].clone()),
                shard: shards[i % shards.len()],
                version: ChunkVersion::new(epoch, 1, i as u32),
                jumbo: false,
            })
            .collect();
        Self::new(ns, epoch, pattern, chunks)
    }

    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn pattern(&self) -> &ShardKeyPattern {
        &self.pattern
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks must tile `[MinKey, MaxKey)` with no gap or overlap, all in one epoch.
    pub fn validate(&self) -> KestrelResult<()> {
        let violation = |detail: String| -> KestrelResult<()> {
            Err(ShardingError::PartitionViolation {
                ns: self.ns.to_string(),
                detail,
            }
            .into())
        };
        let width = self.pattern.width();
        let (Some(first), Some(last)) = (self.chunks.first(), self.chunks.last()) else {
            return violation("no chunks".into());
        };
        if first.range.min != ShardKey::global_min(width) {
            return violation(format!("first chunk starts at {}", first.range.min));
        }
        if last.range.max != ShardKey::global_max(width) {
            return violation(format!("last chunk ends at {}", last.range.max));
        }
        for c in &self.chunks {
            if c.range.is_empty() {
                return violation(format!("empty chunk {}", c.range));
            }
            if c.version.epoch != self.epoch {
                return violation(format!("chunk {} has epoch {}", c.range, c.version.epoch));
            }
        }
        for w in self.chunks.windows(2) {
            if w[0].range.max != w[1].range.min {
                return violation(format!("{} does not abut {}", w[0].range, w[1].range));
            }
        }
        Ok(())
    }

    fn debug_check_partition(&self) {
        debug_assert!(
            self.validate().is_ok(),
            "chunk map mutation broke the partition: {:?}",
            self.validate().err()
        );
    }

    // ── Versions ──

    pub fn collection_version(&self) -> ChunkVersion {
        self.chunks
            .iter()
            .map(|c| c.version)
            .max_by_key(|v| v.placement())
            .unwrap_or(ChunkVersion::new(self.epoch, 0, 0))
    }

    /// Highest version among the chunks `shard` owns, or `0|0` if it owns none.
    pub fn shard_version(&self, shard: ShardId) -> ChunkVersion {
        self.chunks
            .iter()
            .filter(|c| c.shard == shard)
            .map(|c| c.version)
            .max_by_key(|v| v.placement())
            .unwrap_or(ChunkVersion::new(self.epoch, 0, 0))
    }

    // ── Lookup ──

    pub fn chunk_for(&self, key: &ShardKey) -> Option<&Chunk> {
        let idx = self.chunks.partition_point(|c| c.range.min <= *key);
        let c = self.chunks.get(idx.checked_sub(1)?)?;
        c.range.contains(key).then_some(c)
    }

    pub fn owner(&self, key: &ShardKey) -> Option<ShardId> {
        self.chunk_for(key).map(|c| c.shard)
    }

    pub fn chunk_with_range(&self, range: &KeyRange) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range == *range)
    }

    pub fn chunks_for_bounds(&self, bounds: &KeyBounds) -> Vec<&Chunk> {
        self.chunks
            .iter()
            .filter(|c| c.range.overlaps_bounds(bounds))
            .collect()
    }

    pub fn shards_for_bounds(&self, bounds: &KeyBounds) -> BTreeSet<ShardId> {
        self.chunks_for_bounds(bounds)
            .into_iter()
            .map(|c| c.shard)
            .collect()
    }

    pub fn shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|c| c.shard).collect()
    }

    pub fn chunks_on(&self, shard: ShardId) -> Vec<&Chunk> {
        self.chunks.iter().filter(|c| c.shard == shard).collect()
    }

    pub fn ranges_on(&self, shard: ShardId) -> Vec<KeyRange> {
        self.chunks_on(shard)
            .into_iter()
            .map(|c| c.range.clone())
            .collect()
    }

    // ── Incremental refresh ──

    /// Chunks whose version is newer than `since`. Empty if `since` is from
    /// another epoch; callers must then reload the whole map.
    pub fn changed_since(&self, since: &ChunkVersion) -> Vec<Chunk> {
        if since.epoch != self.epoch {
            return Vec::new();
        }
        self.chunks
            .iter()
            .filter(|c| c.version.placement() > since.placement())
            .cloned()
            .collect()
    }

    /// Splice changed chunks in, replacing whatever they overlap.
    pub fn apply_changes(&mut self, changed: Vec<Chunk>) -> KestrelResult<()> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .iter()
            .filter(|old| !changed.iter().any(|c| c.range.intersects(&old.range)))
            .cloned()
            .collect();
        chunks.extend(changed);
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let candidate = Self {
            ns: self.ns.clone(),
            epoch: self.epoch,
            pattern: self.pattern.clone(),
            chunks,
        };
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    // ── Mutations ──

    fn index_of_range(&self, range: &KeyRange) -> KestrelResult<usize> {
        self.chunks
            .iter()
            .position(|c| c.range == *range)
            .ok_or_else(|| {
                ShardingError::InvalidChunkOperation(format!(
                    "{} has no chunk with bounds {range}",
                    self.ns
                ))
                .into()
            })
    }

    /// Split the chunk containing `at` into `[min, at)` and `[at, max)`.
    pub fn split(&mut self, at: &ShardKey) -> KestrelResult<(Chunk, Chunk)> {
        if at.width() != self.pattern.width() {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "split point {at} does not match shard key {}",
                self.pattern
            ))
            .into());
        }
        let idx = self
            .chunks
            .iter()
            .position(|c| c.range.contains(at))
            .ok_or_else(|| {
                ShardingError::InvalidChunkOperation(format!("no chunk contains {at}"))
            })?;
        let old = self.chunks[idx].clone();
        if old.range.min == *at {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "{at} is already a chunk boundary"
            ))
            .into());
        }
        let base = self.collection_version();
        let left = Chunk {
            range: KeyRange::new(old.range.min.clone(), at.clone()),
            shard: old.shard,
            version: base.inc_minor(),
            jumbo: false,
        };
        let right = Chunk {
            range: KeyRange::new(at.clone(), old.range.max.clone()),
            shard: old.shard,
            version: base.inc_minor().inc_minor(),
            jumbo: false,
        };
        self.chunks.splice(idx..=idx, [left.clone(), right.clone()]);
        self.debug_check_partition();
        Ok((left, right))
    }

    /// Merge the contiguous chunks exactly covering `range`; all must live on
    /// one shard.
    pub fn merge(&mut self, range: &KeyRange) -> KestrelResult<Chunk> {
        let first = self
            .chunks
            .iter()
            .position(|c| c.range.min == range.min);
        let last = self.chunks.iter().position(|c| c.range.max == range.max);
        let (Some(first), Some(last)) = (first, last) else {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "{range} does not start and end on chunk boundaries"
            ))
            .into());
        };
        if last <= first {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "{range} covers fewer than two chunks"
            ))
            .into());
        }
        let shard = self.chunks[first].shard;
        if self.chunks[first..=last].iter().any(|c| c.shard != shard) {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "chunks in {range} live on different shards"
            ))
            .into());
        }
        let merged = Chunk {
            range: range.clone(),
            shard,
            version: self.collection_version().inc_minor(),
            jumbo: false,
        };
        self.chunks.splice(first..=last, [merged.clone()]);
        self.debug_check_partition();
        Ok(merged)
    }

    /// Reassign the chunk with exactly `range` to `to`. The moved chunk takes
    /// the next major version; if the donor keeps chunks, one of them gets
    /// `major.1` so the donor's shard version changes too. Returns the moved
    /// chunk's version and the donor's new shard version.
    pub fn move_chunk(
        &mut self,
        range: &KeyRange,
        to: ShardId,
    ) -> KestrelResult<(ChunkVersion, ChunkVersion)> {
        let idx = self.index_of_range(range)?;
        let donor = self.chunks[idx].shard;
        if donor == to {
            return Err(ShardingError::InvalidChunkOperation(format!(
                "chunk {range} already lives on {to}"
            ))
            .into());
        }
        let epoch = self.epoch;
        let moved_version = self.collection_version().inc_major();
        self.chunks[idx].shard = to;
        self.chunks[idx].version = moved_version;
        self.chunks[idx].jumbo = false;
        let control = self
            .chunks
            .iter_mut()
            .filter(|c| c.shard == donor)
            .max_by_key(|c| c.version.placement());
        let donor_version = match control {
            Some(c) => {
                c.version = ChunkVersion::new(epoch, moved_version.major, 1);
                c.version
            }
            None => ChunkVersion::new(epoch, 0, 0),
        };
        self.debug_check_partition();
        Ok((moved_version, donor_version))
    }

    pub fn mark_jumbo(&mut self, range: &KeyRange) -> KestrelResult<()> {
        let idx = self.index_of_range(range)?;
        self.chunks[idx].jumbo = true;
        Ok(())
    }
}
