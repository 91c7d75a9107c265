//! Replicore - Cluster membership and shard-aware transaction routing
//!
//! Replicore manages the membership of a replicated database cluster and
//! routes transactions to the node that can run them.
//!
//! # Architecture
//!
//! Nodes are either **core** nodes, which hold full replicas and take part
//! in replication, or **replicants**, which attach to a core node per shard
//! and forward writes upstream. Nodes talk to each other over a small
//! request/response RPC protocol; the storage engine sits behind the
//! `StorageBackend` trait.
//!
//! # Features
//!
//! - Join, leave and remove nodes with schema propagation
//! - Role-aware cluster views (running/stopped nodes)
//! - Read-only and read-write transactions routed per shard
//! - Dirty (non-transactional) operations routed to the write backend
//! - Table creation and copy-type changes
//! - HTTP API for administration

pub mod config;
pub mod error;
pub mod types;
pub mod role;
pub mod storage;
pub mod shard;
pub mod rpc;
pub mod cluster;
pub mod router;
pub mod node;
pub mod api;

pub use config::ReplicoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::Membership;
    pub use crate::config::ReplicoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{ClusterNode, NodeOptions};
    pub use crate::role::{Role, RoleOracle};
    pub use crate::router::Router;
    pub use crate::rpc::{LocalNetwork, Rpc, TcpRpc};
    pub use crate::storage::{MemoryStorage, StorageBackend};
    pub use crate::types::{NodeName, Shard, TxCall, Value};
}
