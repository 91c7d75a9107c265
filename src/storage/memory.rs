//! In-Process Storage Engine
//!
//! Set-type tables held in memory with serialized transactions. When the
//! schema is a disc copy and a data directory is configured, table
//! definitions, schema peers and disc-copy records are written through to
//! a `DiskStore` and reloaded on start.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::{DiskStore, StorageBackend, StorageStatus, TableWait, TxBody, TxContext, TxKind};
use crate::error::{Error, Result};
use crate::types::{CopyType, NodeName, Record, TableEntry, TableSpec, Value};

/// Upper bound on the readiness poll step inside `wait_for_tables`
const TABLE_POLL_STEP: Duration = Duration::from_millis(100);

struct Table {
    spec: TableSpec,
    records: BTreeMap<Value, Record>,
    /// False for a fresh copy until its contents arrive from a peer
    loaded: bool,
}

impl Table {
    fn new(spec: TableSpec, loaded: bool) -> Self {
        Self {
            spec,
            records: BTreeMap::new(),
            loaded,
        }
    }

    fn is_disc(&self) -> bool {
        self.spec.copy_type == CopyType::Disc
    }

    fn apply(&mut self, changes: &[(Value, Option<Record>)]) {
        for (key, record) in changes {
            match record {
                Some(record) => {
                    self.records.insert(key.clone(), record.clone());
                }
                None => {
                    self.records.remove(key);
                }
            }
        }
    }
}

/// Liveness of a schema peer as last reported
#[derive(Debug, Clone, Serialize)]
pub struct PeerState {
    pub running: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

type Tables = BTreeMap<String, Table>;

/// Record writes (`Some`) and deletes (`None`) per table
type ChangeSet = BTreeMap<String, Vec<(Value, Option<Record>)>>;

fn single_change(table: &str, changes: Vec<(Value, Option<Record>)>) -> ChangeSet {
    let mut set = ChangeSet::new();
    set.insert(table.to_string(), changes);
    set
}

/// In-memory storage engine for one node
pub struct MemoryStorage {
    /// This node's name
    node: NodeName,
    /// Where the schema is persisted (None = memory only)
    data_dir: Option<PathBuf>,
    status: RwLock<StorageStatus>,
    schema_copy: RwLock<CopyType>,
    tables: RwLock<Tables>,
    /// Schema peers (excluding self)
    peers: RwLock<BTreeMap<NodeName, PeerState>>,
    disk: RwLock<Option<Arc<DiskStore>>>,
}

impl MemoryStorage {
    /// Create a memory-only engine. Disc copies are accepted but not persisted.
    pub fn new(node: NodeName) -> Self {
        Self::build(node, None)
    }

    /// Create an engine that persists its disc-copy schema under `data_dir`
    pub fn with_data_dir(node: NodeName, data_dir: PathBuf) -> Self {
        Self::build(node, Some(data_dir))
    }

    fn build(node: NodeName, data_dir: Option<PathBuf>) -> Self {
        Self {
            node,
            data_dir,
            status: RwLock::new(StorageStatus::Stopped),
            schema_copy: RwLock::new(CopyType::Ram),
            tables: RwLock::new(BTreeMap::new()),
            peers: RwLock::new(BTreeMap::new()),
            disk: RwLock::new(None),
        }
    }

    /// Whether an on-disk schema exists for this engine
    pub fn has_disc_schema(&self) -> bool {
        self.data_dir
            .as_deref()
            .map(DiskStore::exists)
            .unwrap_or(false)
    }

    pub async fn schema_copy_type(&self) -> CopyType {
        *self.schema_copy.read().await
    }

    /// All local tables with their definitions
    pub async fn table_entries(&self) -> Vec<TableEntry> {
        self.tables
            .read()
            .await
            .iter()
            .map(|(name, table)| TableEntry {
                name: name.clone(),
                spec: table.spec.clone(),
            })
            .collect()
    }

    /// Snapshot of the peer table
    pub async fn peer_states(&self) -> BTreeMap<NodeName, PeerState> {
        self.peers.read().await.clone()
    }

    async fn ensure_running(&self) -> Result<()> {
        match *self.status.read().await {
            StorageStatus::Running => Ok(()),
            _ => Err(Error::StorageNotRunning),
        }
    }

    async fn ensure_stopped(&self) -> Result<()> {
        match *self.status.read().await {
            StorageStatus::Stopped => Ok(()),
            _ => Err(Error::StorageUnexpectedlyRunning),
        }
    }

    /// Disk store, if the schema is currently persisted
    async fn disk(&self) -> Option<Arc<DiskStore>> {
        self.disk.read().await.clone()
    }

    async fn load_from_disk(&self, disk: &DiskStore) -> Result<()> {
        let mut tables = self.tables.write().await;
        for (name, spec) in disk.load_tables().await? {
            let mut table = Table::new(spec, true);
            if table.is_disc() {
                for record in disk.load_records(&name).await? {
                    table.records.insert(record.key.clone(), record);
                }
            }
            tables.insert(name, table);
        }

        let mut peers = self.peers.write().await;
        for peer in disk.load_peers().await? {
            peers.insert(
                peer,
                PeerState {
                    running: false,
                    last_seen: None,
                },
            );
        }

        tracing::info!(
            "Loaded schema from {:?}: {} tables, {} peers",
            disk.path(),
            tables.len(),
            peers.len()
        );
        Ok(())
    }

    /// Write a change set through to disk for disc-copy tables
    async fn persist_changes(&self, tables: &Tables, changes: &ChangeSet) -> Result<()> {
        let Some(disk) = self.disk().await else {
            return Ok(());
        };
        for (name, table_changes) in changes {
            if tables.get(name).map(Table::is_disc).unwrap_or(false) {
                disk.apply(name, table_changes).await?;
            }
        }
        Ok(())
    }

    /// Persist `changes`, then apply them in memory. A failed disk write
    /// leaves memory untouched.
    async fn commit(&self, tables: &mut Tables, changes: ChangeSet) -> Result<()> {
        self.persist_changes(tables, &changes).await?;
        for (name, table_changes) in &changes {
            if let Some(entry) = tables.get_mut(name) {
                entry.apply(table_changes);
            }
        }
        Ok(())
    }

    async fn add_table(&self, name: &str, spec: &TableSpec, loaded: bool) -> Result<()> {
        self.ensure_running().await?;

        let mut tables = self.tables.write().await;
        if tables.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if let Some(disk) = self.disk().await {
            disk.save_table(name, spec).await?;
        }
        tables.insert(name.to_string(), Table::new(spec.clone(), loaded));
        Ok(())
    }

    async fn apply_dirty(&self, table: &str, changes: Vec<(Value, Option<Record>)>) -> Result<()> {
        self.ensure_running().await?;

        let mut tables = self.tables.write().await;
        if !tables.contains_key(table) {
            return Err(Error::NoSuchTable(table.to_string()));
        }
        self.commit(&mut tables, single_change(table, changes)).await
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn status(&self) -> StorageStatus {
        *self.status.read().await
    }

    async fn start(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            match *status {
                StorageStatus::Running | StorageStatus::Starting => return Ok(()),
                _ => *status = StorageStatus::Starting,
            }
        }

        if let Some(dir) = self.data_dir.as_ref().filter(|d| DiskStore::exists(d)) {
            let loaded = match DiskStore::open(dir) {
                Ok(disk) => {
                    let disk = Arc::new(disk);
                    self.load_from_disk(&disk).await.map(|_| disk)
                }
                Err(e) => Err(e),
            };
            match loaded {
                Ok(disk) => {
                    *self.disk.write().await = Some(disk);
                    *self.schema_copy.write().await = CopyType::Disc;
                }
                Err(e) => {
                    tracing::error!("Failed to load schema from {:?}: {}", dir, e);
                    *self.status.write().await = StorageStatus::Stopped;
                    return Err(e);
                }
            }
        }

        *self.status.write().await = StorageStatus::Running;
        tracing::info!("Storage started on {}", self.node);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut status = self.status.write().await;
            match *status {
                StorageStatus::Stopped | StorageStatus::Stopping => return Ok(()),
                _ => *status = StorageStatus::Stopping,
            }
        }

        // Only what lives in the disk store survives a stop
        self.tables.write().await.clear();
        self.peers.write().await.clear();
        *self.disk.write().await = None;

        *self.status.write().await = StorageStatus::Stopped;
        tracing::info!("Storage stopped on {}", self.node);
        Ok(())
    }

    async fn create_schema(&self) -> Result<()> {
        self.ensure_stopped().await?;
        if self.has_disc_schema() {
            return Err(Error::AlreadyExists("schema".into()));
        }
        if let Some(dir) = &self.data_dir {
            DiskStore::open(dir)?;
            tracing::info!("Created disc schema in {:?}", dir);
        }
        *self.schema_copy.write().await = CopyType::Disc;
        Ok(())
    }

    async fn delete_schema(&self) -> Result<()> {
        self.ensure_stopped().await?;

        self.tables.write().await.clear();
        self.peers.write().await.clear();
        *self.disk.write().await = None;
        *self.schema_copy.write().await = CopyType::Ram;

        if let Some(dir) = &self.data_dir {
            DiskStore::destroy(dir)?;
            tracing::info!("Deleted schema in {:?}", dir);
        }
        Ok(())
    }

    async fn change_schema_copy_type(&self, copy_type: CopyType) -> Result<()> {
        self.ensure_running().await?;

        let mut current = self.schema_copy.write().await;
        if *current == copy_type {
            return Err(Error::AlreadyExists(format!("schema {} copy", copy_type)));
        }

        match (copy_type, &self.data_dir) {
            (CopyType::Disc, Some(dir)) => {
                let disk = Arc::new(DiskStore::open(dir)?);
                let tables = self.tables.read().await;
                for (name, table) in tables.iter() {
                    disk.save_table(name, &table.spec).await?;
                    if table.is_disc() {
                        let changes: Vec<_> = table
                            .records
                            .iter()
                            .map(|(k, r)| (k.clone(), Some(r.clone())))
                            .collect();
                        disk.apply(name, &changes).await?;
                    }
                }
                for peer in self.peers.read().await.keys() {
                    disk.save_peer(peer).await?;
                }
                *self.disk.write().await = Some(disk);
            }
            (CopyType::Ram, Some(dir)) => {
                *self.disk.write().await = None;
                DiskStore::destroy(dir)?;
            }
            (_, None) => {}
        }

        *current = copy_type;
        tracing::info!("Schema on {} is now a {} copy", self.node, copy_type);
        Ok(())
    }

    async fn create_table(&self, table: &str, spec: &TableSpec) -> Result<()> {
        self.add_table(table, spec, true).await?;
        tracing::debug!("Created table {} in shard {}", table, spec.shard);
        Ok(())
    }

    async fn copy_table(&self, table: &str, spec: &TableSpec) -> Result<()> {
        self.add_table(table, spec, false).await?;
        tracing::debug!("Added {} copy of table {}", spec.copy_type, table);
        Ok(())
    }

    async fn table_records(&self, table: &str) -> Result<Vec<Record>> {
        self.ensure_running().await?;
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        if !entry.loaded {
            return Err(Error::Storage(format!("table {} is not loaded", table)));
        }
        Ok(entry.records.values().cloned().collect())
    }

    async fn load_table(&self, table: &str, records: Vec<Record>) -> Result<()> {
        self.ensure_running().await?;

        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        if entry.is_disc() {
            if let Some(disk) = self.disk().await {
                disk.replace_records(table, &records).await?;
            }
        }

        let count = records.len();
        entry.records = records.into_iter().map(|r| (r.key.clone(), r)).collect();
        entry.loaded = true;
        tracing::debug!("Loaded {} records into {}", count, table);
        Ok(())
    }

    async fn wait_for_tables(&self, tables: &[String], timeout: Duration) -> Result<TableWait> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_running().await?;

            let missing: Vec<String> = {
                let local = self.tables.read().await;
                tables
                    .iter()
                    .filter(|t| !local.get(t.as_str()).map(|e| e.loaded).unwrap_or(false))
                    .cloned()
                    .collect()
            };
            if missing.is_empty() {
                return Ok(TableWait::Ready);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(TableWait::Timeout(missing));
            }
            tokio::time::sleep(TABLE_POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn local_tables(&self) -> Vec<String> {
        self.tables.read().await.keys().cloned().collect()
    }

    async fn dirty_read(&self, table: &str, key: &Value) -> Result<Option<Record>> {
        self.ensure_running().await?;
        let tables = self.tables.read().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        Ok(entry.records.get(key).cloned())
    }

    async fn dirty_write(&self, table: &str, record: Record) -> Result<()> {
        self.apply_dirty(table, vec![(record.key.clone(), Some(record))]).await
    }

    async fn dirty_delete(&self, table: &str, key: &Value) -> Result<()> {
        self.apply_dirty(table, vec![(key.clone(), None)]).await
    }

    async fn dirty_delete_object(&self, table: &str, record: &Record) -> Result<()> {
        self.ensure_running().await?;

        // Compare and delete under one write guard
        let mut tables = self.tables.write().await;
        let entry = tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        if entry.records.get(&record.key) != Some(record) {
            return Ok(());
        }
        self.commit(&mut tables, single_change(table, vec![(record.key.clone(), None)]))
            .await
    }

    async fn clear_table(&self, table: &str) -> Result<()> {
        self.ensure_running().await?;

        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        if entry.is_disc() {
            if let Some(disk) = self.disk().await {
                disk.clear_records(table).await?;
            }
        }
        entry.records.clear();
        Ok(())
    }

    async fn transaction(&self, kind: TxKind, body: &TxBody<'_>) -> Result<Value> {
        self.ensure_running().await?;

        match kind {
            TxKind::ReadOnly => {
                let tables = self.tables.read().await;
                let mut ctx = ReadOnlyTx { tables: &*tables };
                body(&mut ctx)
            }
            TxKind::ReadWrite => {
                let mut tables = self.tables.write().await;
                let (result, staged) = {
                    let mut ctx = StagedTx {
                        tables: &*tables,
                        staged: BTreeMap::new(),
                    };
                    let result = body(&mut ctx);
                    (result, ctx.staged)
                };
                let value = result?;

                let mut changes = ChangeSet::new();
                for ((table, key), record) in staged {
                    changes.entry(table).or_default().push((key, record));
                }
                self.commit(&mut tables, changes).await?;
                Ok(value)
            }
        }
    }

    async fn connect(&self, peers: &[NodeName]) -> Result<Vec<NodeName>> {
        self.ensure_running().await?;

        let disk = self.disk().await;
        let mut known = self.peers.write().await;
        let mut connected = Vec::new();
        for peer in peers.iter().filter(|p| **p != self.node) {
            known.insert(
                peer.clone(),
                PeerState {
                    running: true,
                    last_seen: Some(Utc::now()),
                },
            );
            if let Some(disk) = &disk {
                disk.save_peer(peer).await?;
            }
            connected.push(peer.clone());
        }
        Ok(connected)
    }

    async fn remove_extra_peer(&self, node: &NodeName) -> Result<()> {
        if let Some(peer) = self.peers.write().await.get_mut(node) {
            peer.running = false;
        }
        Ok(())
    }

    async fn del_schema_copy(&self, node: &NodeName) -> Result<()> {
        if *node == self.node {
            return Err(Error::Storage(format!(
                "cannot delete own schema copy of {}",
                node
            )));
        }
        if self.peers.write().await.remove(node).is_none() {
            return Err(Error::Storage(format!("{} has no schema copy", node)));
        }
        if let Some(disk) = self.disk().await {
            disk.remove_peer(node).await?;
        }
        Ok(())
    }

    async fn record_peer_liveness(&self, node: &NodeName, running: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(node) {
            if running {
                peer.last_seen = Some(Utc::now());
            }
            if peer.running != running {
                tracing::info!(
                    "Peer {} is now {}",
                    node,
                    if running { "running" } else { "stopped" }
                );
            }
            peer.running = running;
        }
    }

    async fn running_db_nodes(&self) -> Vec<NodeName> {
        if *self.status.read().await != StorageStatus::Running {
            return Vec::new();
        }
        let peers = self.peers.read().await;
        let mut nodes: Vec<NodeName> = peers
            .iter()
            .filter(|(_, p)| p.running)
            .map(|(n, _)| n.clone())
            .collect();
        nodes.push(self.node.clone());
        nodes.sort();
        nodes
    }

    async fn db_nodes(&self) -> Vec<NodeName> {
        let peers = self.peers.read().await;
        let mut nodes: Vec<NodeName> = peers.keys().cloned().collect();
        nodes.push(self.node.clone());
        nodes.sort();
        nodes
    }
}

struct ReadOnlyTx<'a> {
    tables: &'a Tables,
}

impl TxContext for ReadOnlyTx<'_> {
    fn read(&mut self, table: &str, key: &Value) -> Result<Option<Record>> {
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        Ok(entry.records.get(key).cloned())
    }

    fn write(&mut self, table: &str, _record: Record) -> Result<()> {
        Err(Error::ReadOnlyWrite(table.to_string()))
    }

    fn delete(&mut self, table: &str, _key: &Value) -> Result<()> {
        Err(Error::ReadOnlyWrite(table.to_string()))
    }

    fn keys(&mut self, table: &str) -> Result<Vec<Value>> {
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        Ok(entry.records.keys().cloned().collect())
    }
}

/// Read-write context; writes are staged until commit and visible to
/// later reads of the same transaction
struct StagedTx<'a> {
    tables: &'a Tables,
    staged: BTreeMap<(String, Value), Option<Record>>,
}

impl StagedTx<'_> {
    fn table(&self, table: &str) -> Result<&Table> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))
    }
}

impl TxContext for StagedTx<'_> {
    fn read(&mut self, table: &str, key: &Value) -> Result<Option<Record>> {
        let entry = self.table(table)?;
        if let Some(staged) = self.staged.get(&(table.to_string(), key.clone())) {
            return Ok(staged.clone());
        }
        Ok(entry.records.get(key).cloned())
    }

    fn write(&mut self, table: &str, record: Record) -> Result<()> {
        self.table(table)?;
        self.staged
            .insert((table.to_string(), record.key.clone()), Some(record));
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &Value) -> Result<()> {
        self.table(table)?;
        self.staged.insert((table.to_string(), key.clone()), None);
        Ok(())
    }

    fn keys(&mut self, table: &str) -> Result<Vec<Value>> {
        let entry = self.table(table)?;
        let mut keys: std::collections::BTreeSet<Value> =
            entry.records.keys().cloned().collect();
        for ((t, key), record) in &self.staged {
            if t == table {
                match record {
                    Some(_) => keys.insert(key.clone()),
                    None => keys.remove(key),
                };
            }
        }
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shard;
    use tempfile::tempdir;

    fn spec(copy_type: CopyType) -> TableSpec {
        TableSpec {
            shard: Shard::named("sh1"),
            copy_type,
            config: Value::Null,
        }
    }

    async fn running_storage() -> MemoryStorage {
        let storage = MemoryStorage::new(NodeName::from("a:4370"));
        storage.start().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_transaction_commit_and_abort() {
        let storage = running_storage().await;
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();

        storage
            .transaction(TxKind::ReadWrite, &|tx: &mut dyn TxContext| {
                tx.write("orders", Record::new(1, "pending"))?;
                Ok(Value::Null)
            })
            .await
            .unwrap();

        // A failing body leaves no trace
        let result = storage
            .transaction(TxKind::ReadWrite, &|tx: &mut dyn TxContext| {
                tx.write("orders", Record::new(2, "lost"))?;
                Err(Error::Storage("aborted by body".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));

        let keys = storage
            .transaction(TxKind::ReadOnly, &|tx: &mut dyn TxContext| {
                Ok(Value::List(tx.keys("orders")?))
            })
            .await
            .unwrap();
        assert_eq!(keys, Value::List(vec![Value::Int(1)]));
    }

    #[tokio::test]
    async fn test_staged_writes_visible_inside_transaction() {
        let storage = running_storage().await;
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();
        storage.dirty_write("orders", Record::new(1, "a")).await.unwrap();

        let seen = storage
            .transaction(TxKind::ReadWrite, &|tx: &mut dyn TxContext| {
                tx.delete("orders", &Value::Int(1))?;
                tx.write("orders", Record::new(2, "b"))?;
                Ok(Value::List(tx.keys("orders")?))
            })
            .await
            .unwrap();
        assert_eq!(seen, Value::List(vec![Value::Int(2)]));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let storage = running_storage().await;
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();

        let result = storage
            .transaction(TxKind::ReadOnly, &|tx: &mut dyn TxContext| {
                tx.write("orders", Record::new(1, "x"))?;
                Ok(Value::Null)
            })
            .await;
        assert!(matches!(result, Err(Error::ReadOnlyWrite(_))));
    }

    #[tokio::test]
    async fn test_dirty_operations() {
        let storage = running_storage().await;
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();

        storage.dirty_write("orders", Record::new(1, "a")).await.unwrap();
        storage.dirty_write("orders", Record::new(2, "b")).await.unwrap();

        // delete_object only removes an exact match
        storage
            .dirty_delete_object("orders", &Record::new(1, "other"))
            .await
            .unwrap();
        assert!(storage.dirty_read("orders", &Value::Int(1)).await.unwrap().is_some());
        storage
            .dirty_delete_object("orders", &Record::new(1, "a"))
            .await
            .unwrap();
        assert!(storage.dirty_read("orders", &Value::Int(1)).await.unwrap().is_none());

        storage.dirty_delete("orders", &Value::Int(2)).await.unwrap();
        storage.dirty_write("orders", Record::new(3, "c")).await.unwrap();
        storage.clear_table("orders").await.unwrap();
        assert!(storage.dirty_read("orders", &Value::Int(3)).await.unwrap().is_none());

        assert!(matches!(
            storage.dirty_write("missing", Record::new(1, "a")).await,
            Err(Error::NoSuchTable(_))
        ));
    }

    #[tokio::test]
    async fn test_stopped_storage_refuses_work() {
        let storage = MemoryStorage::new(NodeName::from("a:4370"));
        assert!(matches!(
            storage.create_table("orders", &spec(CopyType::Ram)).await,
            Err(Error::StorageNotRunning)
        ));
        assert!(storage.running_db_nodes().await.is_empty());
        assert_eq!(storage.db_nodes().await, vec![NodeName::from("a:4370")]);
    }

    #[tokio::test]
    async fn test_peer_bookkeeping() {
        let storage = running_storage().await;
        let b = NodeName::from("b:4370");

        let connected = storage
            .connect(&[b.clone(), NodeName::from("a:4370")])
            .await
            .unwrap();
        assert_eq!(connected, vec![b.clone()]);
        assert_eq!(storage.running_db_nodes().await.len(), 2);

        storage.record_peer_liveness(&b, false).await;
        assert_eq!(storage.running_db_nodes().await, vec![NodeName::from("a:4370")]);
        assert_eq!(storage.db_nodes().await.len(), 2);

        storage.del_schema_copy(&b).await.unwrap();
        assert_eq!(storage.db_nodes().await, vec![NodeName::from("a:4370")]);
        assert!(storage.del_schema_copy(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_tables_times_out() {
        let storage = running_storage().await;
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();

        let wait = storage
            .wait_for_tables(
                &["orders".to_string(), "users".to_string()],
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(wait, TableWait::Timeout(vec!["users".to_string()]));

        let wait = storage
            .wait_for_tables(&["orders".to_string()], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(wait, TableWait::Ready);
    }

    #[tokio::test]
    async fn test_copied_table_waits_for_contents() {
        let storage = running_storage().await;
        storage.copy_table("orders", &spec(CopyType::Ram)).await.unwrap();

        assert!(storage.table_records("orders").await.is_err());
        let wait = storage
            .wait_for_tables(&["orders".to_string()], Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(wait, TableWait::Timeout(vec!["orders".to_string()]));

        storage
            .load_table("orders", vec![Record::new(1, "paid"), Record::new(2, "open")])
            .await
            .unwrap();
        let wait = storage
            .wait_for_tables(&["orders".to_string()], Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(wait, TableWait::Ready);
        assert_eq!(storage.table_records("orders").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_delete_object_keeps_newer_write() {
        let storage = Arc::new(running_storage().await);
        storage.create_table("orders", &spec(CopyType::Ram)).await.unwrap();

        for round in 0..50 {
            storage.dirty_write("orders", Record::new(1, "old")).await.unwrap();

            let deleter = {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    storage
                        .dirty_delete_object("orders", &Record::new(1, "old"))
                        .await
                })
            };
            let writer = {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    storage.dirty_write("orders", Record::new(1, "new")).await
                })
            };
            deleter.await.unwrap().unwrap();
            writer.await.unwrap().unwrap();

            // Either the delete ran first and the write survived, or the
            // write ran first and the stale delete was a no-op
            assert_eq!(
                storage.dirty_read("orders", &Value::Int(1)).await.unwrap(),
                Some(Record::new(1, "new")),
                "round {}",
                round
            );
        }
    }

    #[tokio::test]
    async fn test_failed_disk_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let storage =
            MemoryStorage::with_data_dir(NodeName::from("a:4370"), dir.path().to_path_buf());
        storage.start().await.unwrap();
        storage.create_table("orders", &spec(CopyType::Disc)).await.unwrap();
        storage.change_schema_copy_type(CopyType::Disc).await.unwrap();
        storage.dirty_write("orders", Record::new(1, "kept")).await.unwrap();

        // Break the record store behind the engine's back
        let path = storage.disk().await.unwrap().path().to_path_buf();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE records")
            .unwrap();

        assert!(storage.dirty_write("orders", Record::new(1, "lost")).await.is_err());
        assert!(storage.dirty_delete("orders", &Value::Int(1)).await.is_err());
        let result = storage
            .transaction(TxKind::ReadWrite, &|tx: &mut dyn TxContext| {
                tx.write("orders", Record::new(2, "lost"))?;
                Ok(Value::Null)
            })
            .await;
        assert!(result.is_err());
        assert!(storage.clear_table("orders").await.is_err());

        assert_eq!(
            storage.dirty_read("orders", &Value::Int(1)).await.unwrap(),
            Some(Record::new(1, "kept"))
        );
        assert!(storage.dirty_read("orders", &Value::Int(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disc_schema_survives_restart() {
        let dir = tempdir().unwrap();
        let node = NodeName::from("a:4370");
        let storage = MemoryStorage::with_data_dir(node.clone(), dir.path().to_path_buf());

        storage.create_schema().await.unwrap();
        storage.start().await.unwrap();
        storage.create_table("orders", &spec(CopyType::Disc)).await.unwrap();
        storage.create_table("sessions", &spec(CopyType::Ram)).await.unwrap();
        storage.dirty_write("orders", Record::new(1, "kept")).await.unwrap();
        storage.dirty_write("sessions", Record::new(1, "dropped")).await.unwrap();
        storage.connect(&[NodeName::from("b:4370")]).await.unwrap();
        storage.stop().await.unwrap();

        storage.start().await.unwrap();
        assert_eq!(storage.local_tables().await, vec!["orders", "sessions"]);
        assert_eq!(
            storage.dirty_read("orders", &Value::Int(1)).await.unwrap(),
            Some(Record::new(1, "kept"))
        );
        assert!(storage.dirty_read("sessions", &Value::Int(1)).await.unwrap().is_none());
        assert_eq!(storage.db_nodes().await.len(), 2);

        storage.stop().await.unwrap();
        storage.delete_schema().await.unwrap();
        assert!(!storage.has_disc_schema());
        storage.start().await.unwrap();
        assert!(storage.local_tables().await.is_empty());
    }

    #[tokio::test]
    async fn test_change_schema_copy_type() {
        let dir = tempdir().unwrap();
        let storage =
            MemoryStorage::with_data_dir(NodeName::from("a:4370"), dir.path().to_path_buf());
        storage.start().await.unwrap();
        storage.create_table("orders", &spec(CopyType::Disc)).await.unwrap();

        storage.change_schema_copy_type(CopyType::Disc).await.unwrap();
        assert!(storage.has_disc_schema());
        assert!(matches!(
            storage.change_schema_copy_type(CopyType::Disc).await,
            Err(Error::AlreadyExists(_))
        ));

        storage.stop().await.unwrap();
        storage.start().await.unwrap();
        assert_eq!(storage.local_tables().await, vec!["orders"]);
    }
}
