//! Manual chunk management: split, merge and move.

use kestrel_common::error::ShardingError;
use kestrel_common::{KestrelResult, Namespace};

use super::topology::mismatch;
use super::{ClusterCommand, ClusterControl, CommandReply};
use crate::catalog::CollectionRouting;
use crate::messages::ShardRequest;

fn sharded(ctl: &ClusterControl, ns: &Namespace) -> KestrelResult<CollectionRouting> {
    let routing = ctl
        .catalog
        .get_collection(ns)
        .ok_or_else(|| ShardingError::NotSharded(ns.to_string()))?;
    if routing.entry.resharding {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "{ns} is being resharded"
        ))
        .into());
    }
    Ok(routing)
}

pub(super) fn split_chunk(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::SplitChunk { ns, at } = cmd else {
        return Err(mismatch(&cmd));
    };
    let routing = sharded(ctl, &ns)?;
    let owner = routing
        .chunks
        .owner(&at)
        .ok_or_else(|| {
            ShardingError::InvalidChunkOperation(format!("no chunk of {ns} contains {at}"))
        })?;
    let (left, right) = ctl.catalog.split_chunk(&ns, &at)?;
    // Only the owner's shard version moved.
    ctl.refresh_collection_on(&[owner], &ns);
    Ok(CommandReply::Split {
        left: left.range,
        right: right.range,
    })
}

pub(super) fn merge_chunks(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::MergeChunks { ns, range } = cmd else {
        return Err(mismatch(&cmd));
    };
    sharded(ctl, &ns)?;
    let merged = ctl.catalog.merge_chunks(&ns, &range)?;
    ctl.refresh_collection_on(&[merged.shard], &ns);
    Ok(CommandReply::Merged(merged.range))
}

/// Runs the migration on the donor and waits for it.
pub(super) fn move_chunk(ctl: &ClusterControl, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
    let ClusterCommand::MoveChunk { ns, range, to } = cmd else {
        return Err(mismatch(&cmd));
    };
    let routing = sharded(ctl, &ns)?;
    let chunk = routing
        .chunks
        .chunk_with_range(&range)
        .cloned()
        .ok_or_else(|| ShardingError::InvalidChunkOperation(format!("{ns} has no chunk {range}")))?;
    if chunk.shard == to {
        return Err(ShardingError::InvalidChunkOperation(format!(
            "chunk {range} of {ns} is already on {to}"
        ))
        .into());
    }
    match ctl.catalog.list_shards().into_iter().find(|s| s.id == to) {
        None => return Err(ShardingError::ShardNotFound(to).into()),
        Some(s) if s.draining => return Err(ShardingError::ShardDraining(to).into()),
        Some(_) => {}
    }
    let outcome = ctl
        .send(
            chunk.shard,
            ShardRequest::MoveRange {
                ns: ns.clone(),
                range: range.clone(),
                to,
                epoch: routing.epoch(),
            },
        )?
        .into_migrated()?;
    ctl.catalog.reload()?;
    tracing::info!(
        ns = %ns,
        range = %range,
        from = %chunk.shard,
        to = %to,
        docs = outcome.docs_cloned,
        "chunk moved",
    );
    Ok(CommandReply::Migrated(outcome))
}
