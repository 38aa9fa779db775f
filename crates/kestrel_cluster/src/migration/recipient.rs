//! Recipient side of a chunk migration.
//!
//! Everything the recipient writes for a migration is tagged `fromMigrate`:
//! the documents already produced change events on the donor. Until the
//! catalog commit the recipient does not own the range, so its reads filter
//! the cloned documents out and an abort only has to delete them.

use std::collections::HashMap;

use parking_lot::Mutex;

use kestrel_common::error::ShardingError;
use kestrel_common::{
    CollectionUuid, DocKey, Document, KestrelResult, KeyRange, Namespace, ShardId,
    ShardKeyPattern, WriteConcern,
};
use kestrel_repl::{CrudOp, OplogDraft, OplogOp, TxnInfo};

use crate::messages::RecvChunkStart;
use crate::shard::server::upsert_op;
use crate::shard::{MigratedSession, ShardServer};

#[derive(Debug, Clone)]
pub struct IncomingMigration {
    pub id: String,
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub pattern: ShardKeyPattern,
    pub range: KeyRange,
    pub donor: ShardId,
    pub docs_received: u64,
    /// Session history installed; only the catalog commit is left.
    pub committed: bool,
}

#[derive(Debug)]
pub struct MigrationRecipient {
    shard: ShardId,
    active: Mutex<HashMap<String, IncomingMigration>>,
}

impl MigrationRecipient {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self) -> Vec<IncomingMigration> {
        self.active
            .lock()
            .values()
            .filter(|m| !m.committed)
            .cloned()
            .collect()
    }

    fn get(&self, id: &str) -> KestrelResult<IncomingMigration> {
        self.active.lock().get(id).cloned().ok_or_else(|| {
            ShardingError::ConflictingOperationInProgress(format!(
                "no incoming migration {id} on {}",
                self.shard
            ))
            .into()
        })
    }

    /// Prepare to receive a range: clear out stale copies and create the
    /// collection with the donor's uuid.
    pub fn start(&self, server: &ShardServer, start: RecvChunkStart) -> KestrelResult<()> {
        {
            let mut active = self.active.lock();
            active.retain(|id, m| !m.committed || *id == start.migration_id);
            if let Some(other) = active.values().find(|m| {
                m.id != start.migration_id && m.ns == start.ns && m.range.intersects(&start.range)
            }) {
                return Err(ShardingError::ConflictingOperationInProgress(format!(
                    "{} already receiving {} from {}",
                    self.shard, other.range, other.donor
                ))
                .into());
            }
        }

        let rs = server.replica_set();
        let ns = &start.ns;
        server.refresh_collection(ns)?;
        // A range this shard once donated may still await deletion.
        server
            .range_deleter()
            .flush_overlapping(rs, server.metadata(), ns, &start.range)?;
        rs.write_with_concern(WriteConcern::Majority, |w| {
            match w.storage().collection_info(ns) {
                Some(info) if info.uuid != start.uuid => {
                    Err(ShardingError::ConflictingOperationInProgress(format!(
                        "{ns} exists on {} with uuid {}, donor has {}",
                        self.shard, info.uuid, start.uuid
                    ))
                    .into())
                }
                Some(_) => Ok(()),
                None => {
                    w.log(
                        OplogDraft::new(
                            ns.clone(),
                            Some(start.uuid),
                            OplogOp::Create { options: start.options },
                        )
                        .from_migrate(),
                    )?;
                    Ok(())
                }
            }
        })?;

        let incoming = IncomingMigration {
            id: start.migration_id.clone(),
            ns: start.ns.clone(),
            uuid: start.uuid,
            pattern: start.pattern.clone(),
            range: start.range.clone(),
            donor: start.donor,
            docs_received: 0,
            committed: false,
        };
        // Leftovers of an earlier attempt.
        let purged = purge_unowned(server, &incoming)?;
        tracing::info!(
            shard = %self.shard,
            migration = %incoming.id,
            donor = %incoming.donor,
            purged,
            "receiving chunk"
        );
        self.active.lock().insert(incoming.id.clone(), incoming);
        Ok(())
    }

    pub fn apply_batch(
        &self,
        server: &ShardServer,
        migration_id: &str,
        upserts: Vec<Document>,
        deletes: Vec<DocKey>,
    ) -> KestrelResult<()> {
        let m = self.get(migration_id)?;
        let n = upserts.len() as u64;
        server
            .replica_set()
            .write_with_concern(WriteConcern::Majority, |w| {
                for doc in upserts {
                    let op = upsert_op(w, &m.ns, doc)?;
                    w.log(
                        OplogDraft::new(
                            m.ns.clone(),
                            Some(m.uuid),
                            OplogOp::Crud(op),
                        ).from_migrate(),
                    )?;
                }
                for doc_key in deletes {
                    // Only copies this migration could have written.
                    let in_range = w
                        .storage()
                        .get_latest(&m.ns, &doc_key)
                        .and_then(|d| m.pattern.extract(&d))
                        .is_some_and(|k| m.range.contains(&k));
                    if in_range {
                        w.log(
                            OplogDraft::new(
                                m.ns.clone(),
                                Some(m.uuid),
                                OplogOp::Crud(CrudOp::Delete { doc_key }),
                            )
                            .from_migrate(),
                        )?;
                    }
                }
                Ok(())
            })?;
        if let Some(entry) = self.active.lock().get_mut(migration_id) {
            entry.docs_received += n;
        }
        Ok(())
    }

    /// Install the donor's retryable-write history for the range and make
    /// everything received majority durable. The catalog commit follows.
    pub fn commit(
        &self,
        server: &ShardServer,
        migration_id: &str,
        sessions: Vec<MigratedSession>,
    ) -> KestrelResult<()> {
        let m = self.get(migration_id)?;
        let rs = server.replica_set();
        if !sessions.is_empty() {
            rs.write(|w| {
                for s in &sessions {
                    let info = TxnInfo {
                        lsid: s.lsid,
                        txn_number: s.txn_number,
                        stmt_ids: s.statements.iter().map(|(id, _)| *id).collect(),
                    };
                    w.log(
                        OplogDraft::new(
                            s.ns.clone(),
                            Some(m.uuid),
                            OplogOp::SessionOutcomes {
                                outcomes: s.statements.clone(),
                            },
                        )
                        .with_txn(info)
                        .from_migrate(),
                    )?;
                }
                Ok(())
            })?;
            server.sessions().install_migrated(&sessions);
        }
        let last = rs.primary()?.oplog().last_optime();
        rs.wait_for(last, WriteConcern::Majority)?;
        if let Some(entry) = self.active.lock().get_mut(migration_id) {
            entry.committed = true;
        }
        tracing::info!(
            shard = %self.shard,
            migration = %m.id,
            docs = m.docs_received,
            sessions = sessions.len(),
            "incoming chunk ready for commit"
        );
        Ok(())
    }

    /// Discard what was received. Unknown ids are a no-op.
    pub fn abort(&self, server: &ShardServer, migration_id: &str) -> KestrelResult<()> {
        let Some(m) = self.active.lock().remove(migration_id) else {
            return Ok(());
        };
        server.metadata().forget_collection(&m.ns);
        server.refresh_collection(&m.ns)?;
        let purged = purge_unowned(server, &m)?;
        tracing::info!(shard = %self.shard, migration = %m.id, purged, "incoming chunk discarded");
        Ok(())
    }
}

/// Delete documents of the migration's range that this shard does not own.
fn purge_unowned(server: &ShardServer, m: &IncomingMigration) -> KestrelResult<u64> {
    let filter = server.filter_for(&m.ns)?;
    let shard = server.id();
    server
        .replica_set()
        .write_with_concern(WriteConcern::Majority, |w| {
            let victims: Vec<DocKey> = w
                .storage()
                .scan_latest_where(&m.ns, |d| {
                    m.pattern
                        .extract(d)
                        .is_some_and(|k| m.range.contains(&k) && !filter.owns_key(shard, &k))
                })
                .iter()
                .filter_map(|d| DocKey::of(d).ok())
                .collect();
            for doc_key in &victims {
                w.log(
                    OplogDraft::new(
                        m.ns.clone(),
                        Some(m.uuid),
                        OplogOp::Crud(CrudOp::Delete {
                            doc_key: doc_key.clone(),
                        }),
                    )
                    .from_migrate(),
                )?;
            }
            Ok(victims.len() as u64)
        })
}
