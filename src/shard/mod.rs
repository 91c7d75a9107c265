//! Shard Registry Module
//!
//! Maps tables to shards and reports the replication status of each shard:
//! its upstream core node, the current session handle and the core nodes
//! able to serve it.

mod registry;

pub use registry::LocalShardRegistry;

use std::time::Duration;

use crate::error::Result;
use crate::types::{NodeName, SessionHandle, Shard, TableEntry, TableSpec, Upstream};

/// Table placement and replication status as seen by this node
#[async_trait::async_trait]
pub trait ShardRegistry: Send + Sync {
    /// Shard a table belongs to
    async fn shard_of(&self, table: &str) -> Option<Shard>;

    /// Current upstream of a shard
    async fn upstream(&self, shard: &Shard) -> Upstream;

    /// Handle of the replication session currently streaming `shard`
    async fn session_handle(&self, shard: &Shard) -> Option<SessionHandle>;

    /// Shards with an established session
    async fn shards_up(&self) -> Vec<Shard>;

    /// A reachable core node serving `shard`, waiting up to `timeout`.
    /// Fails with `Error::Timeout` if none shows up.
    async fn get_core_node(&self, shard: &Shard, timeout: Duration) -> Result<NodeName>;

    /// Register a freshly created table against its shard
    async fn add_table(&self, shard: &Shard, table: &str, spec: &TableSpec) -> Result<()>;

    /// All registered tables
    async fn tables(&self) -> Vec<TableEntry>;

    /// Merge entries learned from another node's schema
    async fn merge_tables(&self, entries: Vec<TableEntry>) -> Result<()>;

    /// Forget all table assignments (the local schema was deleted)
    async fn clear_tables(&self);

    /// Replicants currently attached to this (core) node
    async fn attached_replicants(&self) -> Vec<NodeName>;

    /// Record that a replicant is following this node
    async fn attach_replicant(&self, node: &NodeName);

    /// Core nodes found reachable by discovery
    async fn update_core_nodes(&self, nodes: Vec<NodeName>);
}
