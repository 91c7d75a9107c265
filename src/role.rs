//! Node Roles
//!
//! A node is either a core node (full replica with persistent schema) or a
//! replicant (follows a core node's replication log). The role is fixed
//! for the lifetime of the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransportError};
use crate::rpc::{Request, Response, Rpc};
use crate::types::NodeName;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full participant holding persistent storage and schema
    Core,
    /// Lightweight participant following a core node
    Replicant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Core => write!(f, "core"),
            Role::Replicant => write!(f, "replicant"),
        }
    }
}

/// Reports the role of this node and of other nodes
#[async_trait::async_trait]
pub trait RoleOracle: Send + Sync {
    /// Role of the local node
    fn role(&self) -> Role;

    /// Role of any node, local or remote
    async fn role_of(&self, node: &NodeName) -> Result<Role>;

    /// Record a role learned out of band (e.g. from a ping)
    fn remember(&self, _node: NodeName, _role: Role) {}
}

/// Role oracle backed by the local configuration; remote roles are asked
/// for over RPC once and cached, since a role never changes while the
/// process lives.
pub struct ConfiguredRoles {
    node: NodeName,
    role: Role,
    known: RwLock<HashMap<NodeName, Role>>,
    rpc: Arc<dyn Rpc>,
}

impl ConfiguredRoles {
    pub fn new(node: NodeName, role: Role, rpc: Arc<dyn Rpc>) -> Self {
        Self {
            node,
            role,
            known: RwLock::new(HashMap::new()),
            rpc,
        }
    }

    fn cached(&self, node: &NodeName) -> Option<Role> {
        self.known.read().ok().and_then(|known| known.get(node).copied())
    }
}

#[async_trait::async_trait]
impl RoleOracle for ConfiguredRoles {
    fn role(&self) -> Role {
        self.role
    }

    fn remember(&self, node: NodeName, role: Role) {
        if let Ok(mut known) = self.known.write() {
            known.insert(node, role);
        }
    }

    async fn role_of(&self, node: &NodeName) -> Result<Role> {
        if *node == self.node {
            return Ok(self.role);
        }
        if let Some(role) = self.cached(node) {
            return Ok(role);
        }

        match self.rpc.call(node, Request::Role).await? {
            Response::Role(role) => {
                self.remember(node.clone(), role);
                Ok(role)
            }
            Response::Failed { code, message } => Err(Error::from_remote(code, message)),
            other => Err(TransportError::Protocol {
                node: node.clone(),
                reason: format!("unexpected reply {} to role query", other.type_name()),
            }
            .into()),
        }
    }
}
