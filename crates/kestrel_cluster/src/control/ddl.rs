//! Database and collection DDL.
//!
//! Commands that change where a collection lives, or whether it exists,
//! hold a critical section on every shard involved while the catalog is
//! updated, so no write lands under the old metadata once the new one is
//! committed. Shards are told to refresh before the section is released.

use std::collections::BTreeSet;

use kestrel_common::error::ShardingError;
use kestrel_common::{CollectionUuid, KestrelError, KestrelResult, Namespace, ShardId};
use kestrel_storage::CollectionOptions;

use super::topology::mismatch;
use super::{ClusterCollectionStats, ClusterCommand, ClusterControl, CommandReply};
use crate::catalog::CollectionRouting;
use crate::messages::{CollectionDescription, ShardRequest};
use crate::shard::CriticalScope;

pub(super) fn collection_reply(routing: &CollectionRouting) -> CommandReply {
    CommandReply::Collection {
        ns: routing.entry.ns.clone(),
        epoch: routing.epoch(),
        version: routing.version(),
        chunks: routing.chunks.len(),
    }
}

pub(super) fn enable_sharding(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::EnableSharding { db, primary } = cmd else {
        return Err(mismatch(&cmd));
    };
    Ok(CommandReply::Database(ctl.catalog.create_database(&db, primary)?))
}

// ── movePrimary ──

/// Copy the database's unsharded collections to `to` and make it primary.
/// Sharded collections stay where their chunks are.
pub(super) fn move_primary(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::MovePrimary { db, to } = cmd else {
        return Err(mismatch(&cmd));
    };
    let entry = ctl.require_database(&db)?;
    if entry.primary == to {
        return Ok(CommandReply::Database(entry));
    }
    match ctl.catalog.list_shards().into_iter().find(|s| s.id == to) {
        None => return Err(ShardingError::ShardNotFound(to).into()),
        Some(s) if s.draining => return Err(ShardingError::ShardDraining(to).into()),
        Some(_) => {}
    }
    let from = entry.primary;
    let scope = CriticalScope::Database(db.clone());
    ctl.enter_critical(&[from], &scope, "movePrimary")?;

    let mut copied: Vec<Namespace> = Vec::new();
    let committed = copy_unsharded(ctl, &db, from, to, &mut copied)
        .and_then(|()| ctl.catalog.commit_move_primary(&db, to));
    let moved = match committed {
        Ok(moved) => moved,
        Err(e) => {
            for ns in &copied {
                let req = ShardRequest::DropCollection {
                    ns: ns.clone(),
                    from_migrate: true,
                };
                if let Err(drop_err) = ctl.send(to, req) {
                    tracing::warn!(
                        ns = %ns,
                        shard = %to,
                        error = %drop_err,
                        "partial movePrimary copy left behind",
                    );
                }
            }
            ctl.exit_critical(&[from], &scope);
            return Err(e);
        }
    };

    ctl.refresh_database_on(&[from, to], &db);
    ctl.exit_critical(&[from], &scope);
    for ns in &copied {
        let req = ShardRequest::DropCollection {
            ns: ns.clone(),
            from_migrate: true,
        };
        if let Err(e) = ctl.send(from, req) {
            tracing::warn!(ns = %ns, shard = %from, error = %e, "old primary copy not dropped");
        }
    }
    tracing::info!(db = %db, from = %from, to = %to, collections = copied.len(), "primary moved");
    Ok(CommandReply::Database(moved))
}

fn copy_unsharded(
    ctl: &ClusterControl,
    db: &str,
    from: ShardId,
    to: ShardId,
    copied: &mut Vec<Namespace>,
) -> KestrelResult<()> {
    let sharded = ctl.catalog.sharded_in_db(db);
    let collections = ctl
        .send(from, ShardRequest::ListCollections { db: Some(db.to_string()) })?
        .into_collections()?;
    for collection in collections {
        if sharded.contains(&collection.ns) {
            continue;
        }
        let docs = ctl
            .send(from, ShardRequest::DumpCollection { ns: collection.ns.clone() })?
            .into_docs()?;
        let ns = collection.ns.clone();
        ctl.send(to, ShardRequest::InstallCollection { collection, docs })?
            .into_ok()?;
        copied.push(ns);
    }
    Ok(())
}

// ── shardCollection ──

pub(super) fn shard_collection(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::ShardCollection {
        ns,
        key,
        unique,
        presplit_chunks_per_shard,
    } = cmd
    else {
        return Err(mismatch(&cmd));
    };
    if presplit_chunks_per_shard.is_some() && !key.hashed {
        return Err(KestrelError::BadValue(
            "initial chunks can only be requested for a hashed shard key".into(),
        ));
    }
    if let Some(existing) = ctl.catalog.get_collection(&ns) {
        if existing.entry.key_pattern == key {
            return Ok(collection_reply(&existing));
        }
        return Err(ShardingError::AlreadySharded(ns.to_string()).into());
    }
    let db = ctl.catalog.create_database(&ns.db, None)?;
    let primary = db.primary;
    let uuid = ensure_collection(ctl, primary, &ns)?;

    let mut involved = BTreeSet::from([primary]);
    if presplit_chunks_per_shard.is_some() {
        let stats = ctl
            .send(primary, ShardRequest::CollectionStats { ns: ns.clone() })?
            .into_stats()?;
        if stats.docs > 0 {
            return Err(KestrelError::BadValue(format!(
                "{ns} must be empty to create initial chunks"
            )));
        }
        for entry in ctl.catalog.list_shards() {
            if entry.draining || entry.id == primary {
                continue;
            }
            ctl.send(
                entry.id,
                ShardRequest::CreateCollection {
                    ns: ns.clone(),
                    uuid: Some(uuid),
                    options: CollectionOptions::default(),
                    from_migrate: true,
                },
            )?
            .into_ok()?;
            involved.insert(entry.id);
        }
    }

    let involved: Vec<ShardId> = involved.into_iter().collect();
    let scope = CriticalScope::Collection(ns.clone());
    ctl.enter_critical(&involved, &scope, "shardCollection")?;
    let routing = match ctl
        .catalog
        .shard_collection(&ns, uuid, key, unique, presplit_chunks_per_shard)
    {
        Ok(r) => r,
        Err(e) => {
            ctl.exit_critical(&involved, &scope);
            return Err(e);
        }
    };
    ctl.refresh_collection_on(&involved, &ns);
    ctl.exit_critical(&involved, &scope);
    Ok(collection_reply(&routing))
}

/// The uuid of `ns` on `shard`, creating the collection if it is missing.
fn ensure_collection(
    ctl: &ClusterControl,
    shard: ShardId,
    ns: &Namespace,
) -> KestrelResult<CollectionUuid> {
    if let Some(existing) = describe(ctl, shard, ns)? {
        return Ok(existing.uuid);
    }
    let uuid = CollectionUuid::generate();
    ctl.send(
        shard,
        ShardRequest::CreateCollection {
            ns: ns.clone(),
            uuid: Some(uuid),
            options: CollectionOptions::default(),
            from_migrate: false,
        },
    )?
    .into_ok()?;
    Ok(uuid)
}

fn describe(
    ctl: &ClusterControl,
    shard: ShardId,
    ns: &Namespace,
) -> KestrelResult<Option<CollectionDescription>> {
    Ok(ctl
        .send(shard, ShardRequest::ListCollections { db: Some(ns.db.clone()) })?
        .into_collections()?
        .into_iter()
        .find(|c| c.ns == *ns))
}

// ── create / collMod ──

pub(super) fn create_collection(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::CreateCollection { ns, options } = cmd else {
        return Err(mismatch(&cmd));
    };
    if ctl.catalog.get_collection(&ns).is_some() {
        return Ok(CommandReply::Ok);
    }
    let db = ctl.catalog.create_database(&ns.db, None)?;
    ctl.send(
        db.primary,
        ShardRequest::CreateCollection {
            ns,
            uuid: None,
            options,
            from_migrate: false,
        },
    )?
    .into_ok()?;
    Ok(CommandReply::Ok)
}

/// Shards that hold (or may hold) data of `ns`.
fn holders(ctl: &ClusterControl, ns: &Namespace, primary: ShardId) -> Vec<ShardId> {
    let mut shards = BTreeSet::from([primary]);
    if let Some(routing) = ctl.catalog.get_collection(ns) {
        shards.extend(routing.chunks.shards());
    }
    shards.into_iter().collect()
}

pub(super) fn coll_mod(ctl: &ClusterControl, cmd: ClusterCommand) -> KestrelResult<CommandReply> {
    let ClusterCommand::CollMod { ns, options } = cmd else {
        return Err(mismatch(&cmd));
    };
    let db = ctl.require_database(&ns.db)?;
    let shards = holders(ctl, &ns, db.primary);
    ctl.broadcast(&shards, |_| ShardRequest::CollMod {
        ns: ns.clone(),
        options,
    })?;
    Ok(CommandReply::Ok)
}

// ── drop ──

/// Every shard drops its copy; only the primary's drop is visible to change
/// streams. Dropping something that does not exist succeeds.
pub(super) fn drop_collection(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::DropCollection { ns } = cmd else {
        return Err(mismatch(&cmd));
    };
    let Some(db) = ctl.catalog.get_database(&ns.db) else {
        return Ok(CommandReply::Ok);
    };
    if ctl.catalog.get_collection(&ns).is_some_and(|r| r.entry.resharding) {
        return Err(ShardingError::ConflictingOperationInProgress(format!(
            "{ns} is being resharded"
        ))
        .into());
    }
    let shards = ctl.shard_ids();
    let scope = CriticalScope::Collection(ns.clone());
    ctl.enter_critical(&shards, &scope, "dropCollection")?;
    let dropped = ctl
        .broadcast(&shards, |shard| ShardRequest::DropCollection {
            ns: ns.clone(),
            from_migrate: shard != db.primary,
        })
        .and_then(|()| ctl.catalog.drop_collection(&ns));
    if let Err(e) = dropped {
        ctl.exit_critical(&shards, &scope);
        return Err(e);
    }
    ctl.refresh_collection_on(&shards, &ns);
    ctl.exit_critical(&shards, &scope);
    Ok(CommandReply::Ok)
}

pub(super) fn drop_database(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::DropDatabase { db } = cmd else {
        return Err(mismatch(&cmd));
    };
    let Some(entry) = ctl.catalog.get_database(&db) else {
        return Ok(CommandReply::Ok);
    };
    let shards = ctl.shard_ids();
    let scope = CriticalScope::Database(db.clone());
    ctl.enter_critical(&shards, &scope, "dropDatabase")?;
    let dropped = ctl
        .broadcast(&shards, |shard| ShardRequest::DropDatabase {
            db: db.clone(),
            from_migrate: shard != entry.primary,
        })
        .and_then(|()| ctl.catalog.drop_database(&db));
    let collections = match dropped {
        Ok(c) => c,
        Err(e) => {
            ctl.exit_critical(&shards, &scope);
            return Err(e);
        }
    };
    ctl.refresh_database_on(&shards, &db);
    ctl.exit_critical(&shards, &scope);
    tracing::info!(db = %db, sharded_collections = collections.len(), "database dropped");
    Ok(CommandReply::Ok)
}

// ── collStats ──

pub(super) fn collection_stats(
    ctl: &ClusterControl,
    cmd: ClusterCommand,
) -> KestrelResult<CommandReply> {
    let ClusterCommand::CollectionStats { ns } = cmd else {
        return Err(mismatch(&cmd));
    };
    let db = ctl.require_database(&ns.db)?;
    // Orphans can sit on any shard that once owned a chunk.
    let shards = match ctl.catalog.get_collection(&ns) {
        Some(_) => ctl.shard_ids(),
        None => vec![db.primary],
    };
    let mut out = ClusterCollectionStats::default();
    for shard in shards {
        let stats = ctl
            .send(shard, ShardRequest::CollectionStats { ns: ns.clone() })?
            .into_stats()?;
        out.total.docs += stats.docs;
        out.total.bytes += stats.bytes;
        out.total.orphans += stats.orphans;
        out.per_shard.push((shard, stats));
    }
    Ok(CommandReply::Stats(out))
}
