//! Authorization gate consulted before client operations and privileged
//! inter-node commands.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// Cluster-internal identity used between routers, shards and config servers.
    Internal,
    User(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Internal => write!(f, "__system"),
            Principal::User(u) => write!(f, "{u}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Find,
    Insert,
    Update,
    Remove,
    ChangeStream,
    /// Operator commands: shardCollection, moveChunk, addShard, setFCV, ...
    ClusterManage,
    /// Inter-node commands: migration control, prepare/commit, metadata refresh.
    Internal,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Find => "find",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Remove => "remove",
            Action::ChangeStream => "changeStream",
            Action::ClusterManage => "clusterManage",
            Action::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Cluster,
    Database(String),
    Collection { db: String, coll: String },
}

impl Resource {
    pub fn db(&self) -> Option<&str> {
        match self {
            Resource::Cluster => None,
            Resource::Database(db) => Some(db),
            Resource::Collection { db, .. } => Some(db),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cluster => write!(f, "cluster"),
            Resource::Database(db) => write!(f, "{db}"),
            Resource::Collection { db, coll } => write!(f, "{db}.{coll}"),
        }
    }
}

pub trait AuthzGate: Send + Sync {
    fn authorize(&self, principal: &Principal, action: Action, resource: &Resource) -> bool;

    /// `authorize`, mapped to an `Unauthorized` error on denial.
    fn check(
        &self,
        principal: &Principal,
        action: Action,
        resource: &Resource,
    ) -> KestrelResult<()> {
        if self.authorize(principal, action, resource) {
            Ok(())
        } else {
            tracing::warn!(%principal, %action, %resource, "authorization denied");
            Err(KestrelError::Unauthorized {
                principal: principal.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
            })
        }
    }
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthzGate for AllowAll {
    fn authorize(&self, _: &Principal, _: Action, _: &Resource) -> bool {
        true
    }
}

/// Fixed grant table: per user, the actions allowed cluster-wide or per database.
/// The internal principal is always allowed.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthz {
    cluster_grants: HashMap<String, HashSet<Action>>,
    db_grants: HashMap<(String, String), HashSet<Action>>,
}

impl StaticAuthz {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_cluster(mut self, user: &str, actions: &[Action]) -> Self {
        self.cluster_grants
            .entry(user.to_string())
            .or_default()
            .extend(actions.iter().copied());
        self
    }

    pub fn grant_db(mut self, user: &str, db: &str, actions: &[Action]) -> Self {
        self.db_grants
            .entry((user.to_string(), db.to_string()))
            .or_default()
            .extend(actions.iter().copied());
        self
    }
}

impl AuthzGate for StaticAuthz {
    fn authorize(&self, principal: &Principal, action: Action, resource: &Resource) -> bool {
        let user = match principal {
            Principal::Internal => return true,
            Principal::User(u) => u,
        };
        if action == Action::Internal {
            return false;
        }
        if self
            .cluster_grants
            .get(user)
            .is_some_and(|a| a.contains(&action))
        {
            return true;
        }
        match resource.db() {
            Some(db) => self
                .db_grants
                .get(&(user.clone(), db.to_string()))
                .is_some_and(|a| a.contains(&action)),
            None => false,
        }
    }
}
