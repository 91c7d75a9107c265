//! Storage Backend Module
//!
//! Contract between the cluster core and the transactional, tuple-oriented
//! storage engine of a node, plus an in-process implementation.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStorage;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{CopyType, NodeName, Record, TableSpec, Value};

/// Lifecycle state of the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageStatus::Starting => write!(f, "starting"),
            StorageStatus::Running => write!(f, "running"),
            StorageStatus::Stopping => write!(f, "stopping"),
            StorageStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Kind of transaction to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    ReadOnly,
    ReadWrite,
}

/// Outcome of one table wait round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableWait {
    Ready,
    /// Tables still not loaded when the round timed out
    Timeout(Vec<String>),
}

/// Operations available to a transaction body
pub trait TxContext {
    fn read(&mut self, table: &str, key: &Value) -> Result<Option<Record>>;
    fn write(&mut self, table: &str, record: Record) -> Result<()>;
    fn delete(&mut self, table: &str, key: &Value) -> Result<()>;
    fn keys(&mut self, table: &str) -> Result<Vec<Value>>;
}

/// Transaction body executed by the storage engine
pub type TxBody<'a> = dyn Fn(&mut dyn TxContext) -> Result<Value> + Send + Sync + 'a;

/// Storage engine used by the membership manager and router.
///
/// "Already exists" conditions are reported as `Error::AlreadyExists`;
/// callers decide whether they are benign.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn status(&self) -> StorageStatus;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    async fn create_schema(&self) -> Result<()>;
    /// Delete the local on-disk schema. Storage must be stopped.
    async fn delete_schema(&self) -> Result<()>;
    async fn change_schema_copy_type(&self, copy_type: CopyType) -> Result<()>;

    async fn create_table(&self, table: &str, spec: &TableSpec) -> Result<()>;
    /// Add a local copy of a table that exists in the cluster schema. The
    /// copy is not loaded until `load_table` fills it.
    async fn copy_table(&self, table: &str, spec: &TableSpec) -> Result<()>;
    /// Contents of a loaded local table, served to peers copying it
    async fn table_records(&self, table: &str) -> Result<Vec<Record>>;
    /// Replace the contents of a local table and mark it loaded
    async fn load_table(&self, table: &str, records: Vec<Record>) -> Result<()>;
    /// Wait until `tables` exist locally and are loaded
    async fn wait_for_tables(&self, tables: &[String], timeout: Duration) -> Result<TableWait>;
    async fn local_tables(&self) -> Vec<String>;

    async fn dirty_read(&self, table: &str, key: &Value) -> Result<Option<Record>>;
    async fn dirty_write(&self, table: &str, record: Record) -> Result<()>;
    async fn dirty_delete(&self, table: &str, key: &Value) -> Result<()>;
    async fn dirty_delete_object(&self, table: &str, record: &Record) -> Result<()>;
    async fn clear_table(&self, table: &str) -> Result<()>;

    /// Run `body` in a transaction. Read-write transactions commit only if
    /// the body returns `Ok`.
    async fn transaction(&self, kind: TxKind, body: &TxBody<'_>) -> Result<Value>;

    /// Register extra peers; returns the peers actually connected
    async fn connect(&self, peers: &[NodeName]) -> Result<Vec<NodeName>>;
    async fn remove_extra_peer(&self, node: &NodeName) -> Result<()>;
    /// Drop `node`'s schema copy from the cluster schema
    async fn del_schema_copy(&self, node: &NodeName) -> Result<()>;
    /// Liveness feed for peers
    async fn record_peer_liveness(&self, node: &NodeName, running: bool);

    /// Nodes whose storage is actively participating, including this one
    async fn running_db_nodes(&self) -> Vec<NodeName>;
    /// Statically known schema peers, including this one
    async fn db_nodes(&self) -> Vec<NodeName>;
}
