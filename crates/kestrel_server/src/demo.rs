//! Small workload run after bootstrap: shards a collection, loads a few
//! accounts, moves money between them in cross-shard transactions and
//! tails the resulting change stream.

use serde_json::json;

use kestrel_cluster::{
    ChangeStreamOptions, ClientSession, ClusterCommand, KestrelCluster, WatchTarget,
};
use kestrel_common::{
    Document, Filter, KestrelError, KestrelResult, Namespace, ShardKeyPattern, UpdateSpec,
};

const ACCOUNTS: i64 = 20;
const TRANSFERS: i64 = 5;

#[derive(Debug, Default)]
pub struct DemoReport {
    pub inserted: u64,
    pub transferred: u64,
    pub events: usize,
}

fn account(id: i64) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".into(), json!(id));
    doc.insert("owner".into(), json!(id));
    doc.insert("balance".into(), json!(100));
    doc
}

fn inc_balance(by: i64) -> KestrelResult<UpdateSpec> {
    UpdateSpec::parse(&json!({"$inc": {"balance": by}}))
}

pub fn run(cluster: &KestrelCluster) -> KestrelResult<DemoReport> {
    let ns = Namespace::new("demo", "accounts");
    cluster.admin(ClusterCommand::EnableSharding {
        db: ns.db.clone(),
        primary: None,
    })?;
    cluster.admin(ClusterCommand::ShardCollection {
        ns: ns.clone(),
        key: ShardKeyPattern::hashed("owner"),
        unique: false,
        presplit_chunks_per_shard: Some(2),
    })?;

    let router = cluster.router("demo");
    let mut cursor = router.watch(
        WatchTarget::Collection(ns.clone()),
        ChangeStreamOptions::default(),
    )?;
    let mut report = DemoReport::default();

    report.inserted = router.insert(&ns, (0..ACCOUNTS).map(account).collect())?.n;

    let session = ClientSession::new();
    for i in 0..TRANSFERS {
        let (from, to) = (i, i + ACCOUNTS / 2);
        match transfer(&router, &session, &ns, from, to, 10) {
            Ok(()) => report.transferred += 1,
            Err(e) if e.has_transient_transaction_label() => {
                tracing::warn!(from, to, error = %e, "transfer hit a transient error, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    let expected = report.inserted as usize + 2 * report.transferred as usize;
    for _ in 0..50 {
        if report.events >= expected {
            break;
        }
        let batch = cursor.next_batch()?;
        for event in &batch.events {
            tracing::debug!(
                op = event.operation_type.as_str(),
                key = ?event.document_key,
                ts = %event.cluster_time,
                "demo change event"
            );
        }
        report.events += batch.events.len();
    }
    let total = router.count(&ns, &Filter::all())?;
    tracing::info!(accounts = total, "demo collection ready");
    Ok(report)
}

fn transfer(
    router: &kestrel_cluster::Router,
    session: &ClientSession,
    ns: &Namespace,
    from: i64,
    to: i64,
    amount: i64,
) -> KestrelResult<()> {
    let mut txn = router.start_transaction(session);
    let debited = txn.update(
        ns,
        Filter::eq("owner", json!(from)),
        inc_balance(-amount)?,
        false,
        false,
    )?;
    if debited.n != 1 {
        txn.abort()?;
        return Err(KestrelError::BadValue(format!("account {from} not found")));
    }
    txn.update(ns, Filter::eq("owner", json!(to)), inc_balance(amount)?, false, false)?;
    txn.commit()
}
