//! Local Shard Registry
//!
//! In-process registry driven by the log-shipping subsystem: sessions are
//! opened and torn down through `connect_session` / `disconnect`, core
//! nodes arrive through discovery and replicants attach with a lease.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::watch;

use super::ShardRegistry;
use crate::error::{Error, Result};
use crate::types::{NodeName, SessionHandle, Shard, TableEntry, TableSpec, Upstream};

/// Shard registry for one node
pub struct LocalShardRegistry {
    /// Table name -> definition (including its shard)
    tables: RwLock<BTreeMap<String, TableSpec>>,
    /// Established sessions per shard
    sessions: RwLock<HashMap<Shard, (NodeName, SessionHandle)>>,
    /// Discovered core nodes; receivers wake when it changes
    core_nodes: watch::Sender<Vec<NodeName>>,
    /// Attached replicants and when they last checked in
    replicants: RwLock<HashMap<NodeName, Instant>>,
    /// How long an attachment stays valid without a check-in
    replicant_lease: Duration,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl LocalShardRegistry {
    pub fn new(replicant_lease: Duration) -> Self {
        let (core_nodes, _) = watch::channel(Vec::new());
        Self {
            tables: RwLock::new(BTreeMap::new()),
            sessions: RwLock::new(HashMap::new()),
            core_nodes,
            replicants: RwLock::new(HashMap::new()),
            replicant_lease,
        }
    }

    /// Establish (or re-establish) the replication session of `shard`.
    /// Every call yields a new handle.
    pub fn connect_session(&self, shard: &Shard, upstream: &NodeName) -> SessionHandle {
        let handle = SessionHandle::generate();
        write(&self.sessions).insert(shard.clone(), (upstream.clone(), handle));
        tracing::info!("Shard {} streaming from {} (session {})", shard, upstream, handle);
        handle
    }

    /// Tear down the session of `shard`
    pub fn disconnect(&self, shard: &Shard) {
        if write(&self.sessions).remove(shard).is_some() {
            tracing::warn!("Shard {} disconnected", shard);
        }
    }

    /// Distinct replicated shards with at least one registered table
    pub fn known_shards(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = read(&self.tables)
            .values()
            .map(|spec| spec.shard.clone())
            .filter(|shard| !shard.is_local_content())
            .collect();
        shards.sort();
        shards.dedup();
        shards
    }

    fn insert_table(&self, table: &str, spec: &TableSpec) -> Result<()> {
        let mut tables = write(&self.tables);
        match tables.get(table) {
            Some(existing) if existing.shard == spec.shard => Ok(()),
            Some(existing) => Err(Error::InvalidTableDefinition {
                table: table.to_string(),
                reason: format!(
                    "already assigned to shard {}, cannot move to {}",
                    existing.shard, spec.shard
                ),
            }),
            None => {
                tables.insert(table.to_string(), spec.clone());
                Ok(())
            }
        }
    }

    fn pick_core_node(&self, shard: &Shard) -> Option<NodeName> {
        if let Some((node, _)) = read(&self.sessions).get(shard) {
            return Some(node.clone());
        }
        self.core_nodes
            .borrow()
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

#[async_trait::async_trait]
impl ShardRegistry for LocalShardRegistry {
    async fn shard_of(&self, table: &str) -> Option<Shard> {
        read(&self.tables).get(table).map(|spec| spec.shard.clone())
    }

    async fn upstream(&self, shard: &Shard) -> Upstream {
        match read(&self.sessions).get(shard) {
            Some((node, session)) => Upstream::Connected {
                node: node.clone(),
                session: *session,
            },
            None => Upstream::Disconnected,
        }
    }

    async fn session_handle(&self, shard: &Shard) -> Option<SessionHandle> {
        read(&self.sessions).get(shard).map(|(_, handle)| *handle)
    }

    async fn shards_up(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = read(&self.sessions).keys().cloned().collect();
        shards.sort();
        shards
    }

    async fn get_core_node(&self, shard: &Shard, timeout: Duration) -> Result<NodeName> {
        let mut changes = self.core_nodes.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(node) = self.pick_core_node(shard) {
                return Ok(node);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    return Err(Error::Timeout(format!(
                        "no core node for shard {} within {:?}",
                        shard, timeout
                    )));
                }
            }
        }
    }

    async fn add_table(&self, shard: &Shard, table: &str, spec: &TableSpec) -> Result<()> {
        if spec.shard != *shard {
            return Err(Error::InvalidTableDefinition {
                table: table.to_string(),
                reason: format!("declared in shard {} but added to {}", spec.shard, shard),
            });
        }
        self.insert_table(table, spec)?;
        tracing::debug!("Table {} registered in shard {}", table, shard);
        Ok(())
    }

    async fn tables(&self) -> Vec<TableEntry> {
        read(&self.tables)
            .iter()
            .map(|(name, spec)| TableEntry {
                name: name.clone(),
                spec: spec.clone(),
            })
            .collect()
    }

    async fn merge_tables(&self, entries: Vec<TableEntry>) -> Result<()> {
        for entry in entries {
            self.insert_table(&entry.name, &entry.spec)?;
        }
        Ok(())
    }

    async fn clear_tables(&self) {
        write(&self.tables).clear();
    }

    async fn attached_replicants(&self) -> Vec<NodeName> {
        let lease = self.replicant_lease;
        let mut replicants = write(&self.replicants);
        replicants.retain(|_, seen| seen.elapsed() < lease);
        let mut nodes: Vec<NodeName> = replicants.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    async fn attach_replicant(&self, node: &NodeName) {
        if write(&self.replicants)
            .insert(node.clone(), Instant::now())
            .is_none()
        {
            tracing::info!("Replicant {} attached", node);
        }
    }

    async fn update_core_nodes(&self, mut nodes: Vec<NodeName>) {
        nodes.sort();
        nodes.dedup();
        self.core_nodes.send_if_modified(|current| {
            if *current == nodes {
                false
            } else {
                tracing::debug!("Discovered core nodes: {:?}", nodes);
                *current = nodes;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CopyType, Value};
    use std::sync::Arc;

    fn spec(shard: &str) -> TableSpec {
        TableSpec {
            shard: Shard::named(shard),
            copy_type: CopyType::Ram,
            config: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_table_assignment_is_permanent() {
        let registry = LocalShardRegistry::new(Duration::from_secs(3));
        let sh1 = Shard::named("sh1");

        registry.add_table(&sh1, "orders", &spec("sh1")).await.unwrap();
        // Same assignment again is accepted
        registry.add_table(&sh1, "orders", &spec("sh1")).await.unwrap();

        let moved = registry
            .add_table(&Shard::named("sh2"), "orders", &spec("sh2"))
            .await;
        assert!(matches!(moved, Err(Error::InvalidTableDefinition { .. })));
        assert_eq!(registry.shard_of("orders").await, Some(sh1));
        assert_eq!(registry.tables().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_change_handle() {
        let registry = LocalShardRegistry::new(Duration::from_secs(3));
        let sh1 = Shard::named("sh1");
        let core = NodeName::from("c:4370");

        assert_eq!(registry.upstream(&sh1).await, Upstream::Disconnected);
        let h1 = registry.connect_session(&sh1, &core);
        let h2 = registry.connect_session(&sh1, &core);
        assert_ne!(h1, h2);
        assert_eq!(registry.session_handle(&sh1).await, Some(h2));
        assert_eq!(registry.shards_up().await, vec![sh1.clone()]);

        registry.disconnect(&sh1);
        assert!(registry.shards_up().await.is_empty());
        assert_eq!(registry.session_handle(&sh1).await, None);
    }

    #[tokio::test]
    async fn test_get_core_node_times_out() {
        let registry = LocalShardRegistry::new(Duration::from_secs(3));
        let result = registry
            .get_core_node(&Shard::named("sh1"), Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_get_core_node_wakes_on_discovery() {
        let registry = Arc::new(LocalShardRegistry::new(Duration::from_secs(3)));

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_core_node(&Shard::named("sh1"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.update_core_nodes(vec![NodeName::from("c:4370")]).await;

        let node = waiter.await.unwrap().unwrap();
        assert_eq!(node, NodeName::from("c:4370"));
    }

    #[tokio::test]
    async fn test_replicant_lease_expires() {
        let registry = LocalShardRegistry::new(Duration::from_millis(50));
        registry.attach_replicant(&NodeName::from("r:4370")).await;
        assert_eq!(registry.attached_replicants().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.attached_replicants().await.is_empty());
    }
}
