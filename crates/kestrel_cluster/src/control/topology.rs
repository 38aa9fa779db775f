//! Shard membership, feature compatibility version and operation status.

use kestrel_common::{KestrelError, KestrelResult};

use super::{ClusterCommand, ClusterControl, CommandReply};
use crate::catalog::RemoveShardStatus;
use crate::messages::ShardRequest;

pub(super) fn add_shard(ctl: &ClusterControl, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
    let ClusterCommand::AddShard { shard } = cmd else {
        return Err(mismatch(&cmd));
    };
    // The new shard has to agree on the cluster FCV before it owns anything.
    ctl.send(shard, ShardRequest::SetFcv { state: ctl.catalog.fcv() })?
        .into_ok()?;
    let entry = ctl.catalog.add_shard(shard)?;
    Ok(CommandReply::Shard(entry))
}

/// Draining is carried out by the balancer (chunks) and `MovePrimary`
/// (databases); repeated calls report what is left.
pub(super) fn remove_shard(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::RemoveShard { shard } = cmd else {
        return Err(mismatch(&cmd));
    };
    let status = ctl.catalog.remove_shard(shard)?;
    if let RemoveShardStatus::Ongoing { chunks, databases } = &status {
        tracing::info!(shard = %shard, chunks, databases = databases.len(), "shard still draining");
    }
    Ok(CommandReply::RemoveShard(status))
}

pub(super) fn list_shards(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::ListShards = cmd else {
        return Err(mismatch(&cmd));
    };
    Ok(CommandReply::Shards(ctl.catalog.list_shards()))
}

/// Two steps, each pushed to every shard: enter the transitional state,
/// then settle on the target. A failure in between leaves the cluster
/// transitioning; repeating the command finishes it.
pub(super) fn set_fcv(ctl: &ClusterControl, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
    let ClusterCommand::SetFcv { version } = cmd else {
        return Err(mismatch(&cmd));
    };
    let shards = ctl.shard_ids();
    let transitional = ctl.catalog.begin_fcv_change(version)?;
    if transitional.is_transitioning() {
        ctl.broadcast(&shards, |_| ShardRequest::SetFcv { state: transitional })?;
    }
    let settled = ctl.catalog.complete_fcv_change(version)?;
    ctl.broadcast(&shards, |_| ShardRequest::SetFcv { state: settled })?;
    Ok(CommandReply::Fcv(settled))
}

pub(super) fn operation_status(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::GetOperationStatus { id } = cmd else {
        return Err(mismatch(&cmd));
    };
    ctl.operations
        .get(id)
        .map(CommandReply::Operation)
        .ok_or_else(|| KestrelError::BadValue(format!("no operation with id {id}")))
}

pub(super) fn mismatch(cmd: &ClusterCommand) -> KestrelError {
    KestrelError::internal_bug(
        "E-CTL-002",
        "command routed to the wrong handler",
        format!("{cmd:?}"),
    )
}
