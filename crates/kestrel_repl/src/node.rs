//! A single replica-set member: its storage, oplog, role and the table of
//! transactions it holds in the prepared state.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use kestrel_common::{LogicalTimestamp, NodeId, OpTime, StmtId, TxnKey};
use kestrel_storage::StorageNode;

use crate::election::{Lease, VoterState};
use crate::oplog::{Oplog, TxnOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Primary,
    Secondary,
    /// Undoing divergent history; serves nothing.
    Rollback,
    /// Crashed or unreachable.
    Down,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// A transaction whose `prepare` entry this member has applied but whose
/// outcome it has not.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTxn {
    pub key: TxnKey,
    pub prepare_ts: LogicalTimestamp,
    pub ops: Vec<TxnOp>,
    pub stmt_ids: Vec<StmtId>,
}

#[derive(Debug)]
struct NodeState {
    member_state: MemberState,
    voter: VoterState,
    lease: Option<Lease>,
    last_applied: OpTime,
}

pub struct ReplicaNode {
    id: NodeId,
    storage: Arc<StorageNode>,
    oplog: Oplog,
    state: RwLock<NodeState>,
    prepared: Mutex<BTreeMap<TxnKey, PreparedTxn>>,
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("ReplicaNode")
            .field("id", &self.id)
            .field("state", &st.member_state)
            .field("term", &st.voter.term)
            .field("last_applied", &st.last_applied)
            .finish()
    }
}

impl ReplicaNode {
    pub fn new(id: NodeId, set_name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            storage: StorageNode::new(format!("{set_name}/{id}")),
            oplog: Oplog::new(),
            state: RwLock::new(NodeState {
                member_state: MemberState::Secondary,
                voter: VoterState::default(),
                lease: None,
                last_applied: OpTime::default(),
            }),
            prepared: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn storage(&self) -> &Arc<StorageNode> {
        &self.storage
    }

    pub fn oplog(&self) -> &Oplog {
        &self.oplog
    }

    // ── Role ──

    pub fn member_state(&self) -> MemberState {
        self.state.read().member_state
    }

    pub(crate) fn set_member_state(&self, s: MemberState) {
        let mut st = self.state.write();
        if s != MemberState::Primary {
            st.lease = None;
        }
        st.member_state = s;
    }

    pub fn is_up(&self) -> bool {
        self.member_state() != MemberState::Down
    }

    pub fn is_primary(&self) -> bool {
        self.member_state() == MemberState::Primary
    }

    /// Primary whose lease is still valid.
    pub fn can_accept_writes(&self) -> bool {
        let st = self.state.read();
        st.member_state == MemberState::Primary && st.lease.is_some_and(|l| l.is_valid())
    }

    pub fn term(&self) -> u64 {
        self.state.read().voter.term
    }

    pub(crate) fn with_voter<R>(&self, f: impl FnOnce(&mut VoterState) -> R) -> R {
        f(&mut self.state.write().voter)
    }

    pub(crate) fn renew_lease(&self, lease: Lease) {
        let mut st = self.state.write();
        if st.member_state == MemberState::Primary {
            st.lease = Some(lease);
        }
    }

    // ── Progress ──

    pub fn last_applied(&self) -> OpTime {
        self.state.read().last_applied
    }

    pub(crate) fn set_last_applied(&self, op: OpTime) {
        self.state.write().last_applied = op;
    }

    // ── Prepared transactions ──

    pub(crate) fn add_prepared(&self, txn: PreparedTxn) {
        self.prepared.lock().insert(txn.key, txn);
    }

    pub(crate) fn take_prepared(&self, key: &TxnKey) -> Option<PreparedTxn> {
        self.prepared.lock().remove(key)
    }

    pub fn prepared(&self, key: &TxnKey) -> Option<PreparedTxn> {
        self.prepared.lock().get(key).cloned()
    }

    pub fn prepared_txns(&self) -> Vec<PreparedTxn> {
        self.prepared.lock().values().cloned().collect()
    }

    pub fn oldest_prepare_ts(&self) -> Option<LogicalTimestamp> {
        self.prepared.lock().values().map(|p| p.prepare_ts).min()
    }

    pub(crate) fn replace_prepared(&self, txns: Vec<PreparedTxn>) {
        let mut table = self.prepared.lock();
        table.clear();
        for t in txns {
            table.insert(t.key, t);
        }
    }
}
