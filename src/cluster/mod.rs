//! Cluster Membership Management
//!
//! Join, leave and remove operations with the schema lifecycle they
//! imply, topology queries across core nodes and their replicants, and
//! the liveness probe that keeps peer state current.

mod copy;
mod wait;
#[cfg(test)]
mod tests;

pub use copy::fetch_table;
pub use wait::{wait_for, wait_for_tables, Reconnect, WaitConfig};

use std::sync::Arc;

use futures::future::join_all;

use crate::error::{Error, Result};
use crate::role::{Role, RoleOracle};
use crate::rpc::{self, Request, Response, Rpc};
use crate::shard::ShardRegistry;
use crate::storage::{StorageBackend, StorageStatus};
use crate::types::{ClusterView, CopyType, NodeFilter, NodeName, NodeStatus, Upstream};

/// Cluster membership manager of one node
pub struct Membership {
    node: NodeName,
    roles: Arc<dyn RoleOracle>,
    storage: Arc<dyn StorageBackend>,
    shards: Arc<dyn ShardRegistry>,
    rpc: Arc<dyn Rpc>,
    wait: WaitConfig,
}

impl Membership {
    pub fn new(
        node: NodeName,
        roles: Arc<dyn RoleOracle>,
        storage: Arc<dyn StorageBackend>,
        shards: Arc<dyn ShardRegistry>,
        rpc: Arc<dyn Rpc>,
        wait: WaitConfig,
    ) -> Self {
        Self {
            node,
            roles,
            storage,
            shards,
            rpc,
            wait,
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    // ========== Membership changes ==========

    /// Join the cluster `target` belongs to.
    ///
    /// Only core nodes join each other; any other pairing is a no-op. The
    /// first failing step aborts the sequence and nothing is rolled back.
    pub async fn join_cluster(&self, target: &NodeName) -> Result<()> {
        self.reject_self(target)?;

        // A replicant never joins, whether or not the target answers
        if self.roles.role() != Role::Core {
            tracing::info!("Ignoring join of replicant {} to {}", self.node, target);
            return Ok(());
        }
        if self.roles.role_of(target).await? != Role::Core {
            tracing::info!("Ignoring join of {} to replicant {}", self.node, target);
            return Ok(());
        }

        tracing::info!("Joining cluster via {}", target);

        self.ensure_stopped().await?;
        self.delete_schema().await?;
        self.ensure_started().await?;
        self.connect(target).await?;

        match self.storage.change_schema_copy_type(CopyType::Disc).await {
            Ok(()) | Err(Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tables = Vec::new();
        for entry in self.shards.tables().await {
            if entry.spec.shard.is_local_content() {
                continue;
            }
            match self.storage.copy_table(&entry.name, &entry.spec).await {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            tables.push(entry.name);
        }

        let sources = self.copy_sources(Some(target)).await;
        for table in &tables {
            if let Err(e) =
                fetch_table(self.rpc.as_ref(), self.storage.as_ref(), table, &sources).await
            {
                tracing::warn!("Contents of {} not copied yet: {}", table, e);
            }
        }

        wait_for_tables(self.storage.as_ref(), tables, self, &self.wait).await?;

        tracing::info!("{} joined the cluster of {}", self.node, target);
        Ok(())
    }

    /// Leave the cluster via any running peer
    pub async fn leave_cluster(&self) -> Result<()> {
        let peers: Vec<NodeName> = self
            .running_nodes()
            .await
            .into_iter()
            .filter(|n| *n != self.node)
            .collect();

        if peers.is_empty() {
            return Err(Error::NodeNotInCluster);
        }

        // Storage is stopped after the first attempt, so later peers are
        // tried without rechecking that they run
        for peer in &peers {
            match self.leave_via(peer).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!("Failed to leave via {}: {}", peer, e),
            }
        }

        Err(Error::FailedToLeave { remaining: peers })
    }

    /// Leave the cluster through `target`, which drops our schema copy
    pub async fn leave_cluster_via(&self, target: &NodeName) -> Result<()> {
        self.reject_self(target)?;

        if !self.is_running_db_node(target).await {
            return Err(Error::NodeNotRunning(target.clone()));
        }
        self.leave_via(target).await
    }

    async fn leave_via(&self, target: &NodeName) -> Result<()> {
        tracing::info!("Leaving cluster via {}", target);
        self.ensure_stopped().await?;
        rpc::call_unit(
            self.rpc.as_ref(),
            target,
            Request::DelSchemaCopy {
                node: self.node.clone(),
            },
        )
        .await?;
        self.delete_schema().await?;

        tracing::info!("{} left the cluster", self.node);
        Ok(())
    }

    /// Remove `target` from the cluster on its behalf
    pub async fn remove_from_cluster(&self, target: &NodeName) -> Result<()> {
        self.reject_self(target)?;

        let Some(status) = self.cluster_status(target).await else {
            return Err(Error::NodeNotInCluster);
        };
        let running = status == NodeStatus::Running;
        // Replicants are members without a schema copy here
        let schema_peer = self.storage.db_nodes().await.contains(target);

        tracing::info!("Removing {} node {}", status, target);
        if running {
            rpc::call_unit(self.rpc.as_ref(), target, Request::StopStorage).await?;
        }
        if schema_peer {
            self.storage.remove_extra_peer(target).await?;
            self.storage.del_schema_copy(target).await?;
        }
        if running {
            rpc::call_unit(self.rpc.as_ref(), target, Request::DeleteSchema).await?;
        }

        tracing::info!("{} removed from the cluster", target);
        Ok(())
    }

    // ========== Topology ==========

    /// Running nodes: running cores plus the replicants attached to them.
    ///
    /// A replicant asks the upstream of its first up shard and reports
    /// nothing if there is none or the call fails.
    pub async fn running_nodes(&self) -> Vec<NodeName> {
        match self.roles.role() {
            Role::Core => {
                let cores = self.storage.running_db_nodes().await;
                let replicants = join_all(cores.iter().map(|core| self.replicants_of(core))).await;

                let mut nodes = cores;
                nodes.extend(replicants.into_iter().flatten());
                nodes.sort();
                nodes.dedup();
                nodes
            }
            Role::Replicant => {
                let Some(shard) = self.shards.shards_up().await.into_iter().next() else {
                    return Vec::new();
                };
                let Upstream::Connected { node: core, .. } = self.shards.upstream(&shard).await
                else {
                    return Vec::new();
                };
                match rpc::call_nodes(self.rpc.as_ref(), &core, Request::RunningNodes).await {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        tracing::debug!("Running nodes query to {} failed: {}", core, e);
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn replicants_of(&self, core: &NodeName) -> Vec<NodeName> {
        if *core == self.node {
            return self.shards.attached_replicants().await;
        }
        match self.rpc.call(core, Request::Replicants).await {
            Ok(Response::Nodes(nodes)) => nodes,
            Ok(other) => {
                tracing::debug!("Ignoring {} from {} to replicant query", other.type_name(), core);
                Vec::new()
            }
            Err(e) => {
                tracing::debug!("Replicant query to {} failed: {}", core, e);
                Vec::new()
            }
        }
    }

    /// Nodes by membership state.
    ///
    /// A replicant that is stopped is in neither the running set nor the
    /// schema peer list, so it does not show up at all.
    pub async fn cluster_nodes(&self, filter: NodeFilter) -> Vec<NodeName> {
        let running = self.running_nodes().await;
        match filter {
            NodeFilter::Running => running,
            NodeFilter::All => Self::union(&running, self.storage.db_nodes().await),
            NodeFilter::Stopped => {
                let all = Self::union(&running, self.storage.db_nodes().await);
                all.into_iter().filter(|n| !running.contains(n)).collect()
            }
        }
    }

    fn union(running: &[NodeName], db_nodes: Vec<NodeName>) -> Vec<NodeName> {
        let mut all = running.to_vec();
        all.extend(db_nodes);
        all.sort();
        all.dedup();
        all
    }

    /// Running/stopped view in one pass
    pub async fn cluster_view(&self) -> ClusterView {
        let running = self.running_nodes().await;
        let all = Self::union(&running, self.storage.db_nodes().await);
        let stopped = all.into_iter().filter(|n| !running.contains(n)).collect();
        ClusterView {
            running_nodes: running,
            stopped_nodes: stopped,
        }
    }

    /// Status of `node`, or `None` if it is not a member
    pub async fn cluster_status(&self, node: &NodeName) -> Option<NodeStatus> {
        let view = self.cluster_view().await;
        if view.running_nodes.contains(node) {
            Some(NodeStatus::Running)
        } else if view.stopped_nodes.contains(node) {
            Some(NodeStatus::Stopped)
        } else {
            None
        }
    }

    /// Whether `node` is a member. The local node only counts as a member
    /// if it is not alone.
    pub async fn is_node_in_cluster(&self, node: &NodeName) -> bool {
        let all = self.cluster_nodes(NodeFilter::All).await;
        if *node == self.node {
            all != [self.node.clone()]
        } else {
            all.contains(node)
        }
    }

    async fn is_running_db_node(&self, node: &NodeName) -> bool {
        self.storage.running_db_nodes().await.contains(node)
    }

    /// Running schema peers to copy table contents from, `first` leading
    async fn copy_sources(&self, first: Option<&NodeName>) -> Vec<NodeName> {
        let mut sources: Vec<NodeName> = self
            .storage
            .running_db_nodes()
            .await
            .into_iter()
            .filter(|n| *n != self.node && Some(n) != first)
            .collect();
        if let Some(first) = first {
            sources.insert(0, first.clone());
        }
        sources
    }

    // ========== Schema lifecycle ==========

    /// Stop storage and wait until it is down
    pub async fn ensure_stopped(&self) -> Result<()> {
        self.storage.stop().await?;
        wait_for(self.storage.as_ref(), StorageStatus::Stopped, self.wait.poll_interval).await
    }

    /// Start storage and wait until it is up
    pub async fn ensure_started(&self) -> Result<()> {
        self.storage.start().await?;
        wait_for(self.storage.as_ref(), StorageStatus::Running, self.wait.poll_interval).await
    }

    /// Delete the local schema and forget its table assignments
    pub async fn delete_schema(&self) -> Result<()> {
        self.storage.delete_schema().await?;
        self.shards.clear_tables().await;
        Ok(())
    }

    /// Drop the schema copy of `node` (it is leaving through us)
    pub async fn del_schema_copy(&self, node: &NodeName) -> Result<()> {
        self.storage.del_schema_copy(node).await?;
        tracing::info!("Dropped schema copy of {}", node);
        Ok(())
    }

    /// Accept `node` as an extra peer; returns our schema peers
    pub async fn add_peer(&self, node: &NodeName) -> Result<Vec<NodeName>> {
        self.storage.connect(std::slice::from_ref(node)).await?;
        tracing::info!("{} connected as extra peer", node);
        Ok(self.storage.db_nodes().await)
    }

    /// Connect to the cluster of `target` and merge its schema
    async fn connect(&self, target: &NodeName) -> Result<()> {
        let add_self = Request::AddPeer {
            node: self.node.clone(),
        };
        let peers = match rpc::call_nodes(self.rpc.as_ref(), target, add_self.clone()).await {
            Ok(peers) => peers,
            Err(Error::Transport(e)) => {
                tracing::warn!("Cannot reach {}: {}", target, e);
                return Err(Error::FailedToConnectNode(target.clone()));
            }
            Err(e) => return Err(e),
        };

        let mut others: Vec<NodeName> = peers
            .into_iter()
            .filter(|n| *n != self.node && n != target)
            .collect();

        // Introduce ourselves to the rest of the target's cluster
        for peer in &others {
            if let Err(e) = rpc::call_nodes(self.rpc.as_ref(), peer, add_self.clone()).await {
                tracing::warn!("Failed to register with {}: {}", peer, e);
            }
        }

        others.push(target.clone());
        let connected = self.storage.connect(&others).await?;
        if !connected.contains(target) {
            return Err(Error::FailedToConnectNode(target.clone()));
        }

        match rpc::call(self.rpc.as_ref(), target, Request::Tables).await? {
            Response::Tables(entries) => self.shards.merge_tables(entries).await,
            other => Err(rpc::unexpected(target, &other)),
        }
    }

    fn reject_self(&self, target: &NodeName) -> Result<()> {
        if *target == self.node {
            Err(Error::SelfTarget(target.clone()))
        } else {
            Ok(())
        }
    }

    // ========== Liveness ==========

    /// Ping schema peers and `seeds` once and feed the results into
    /// storage (core) or core discovery (replicant)
    pub async fn probe_peers(&self, seeds: &[NodeName]) {
        let mut targets = self.storage.db_nodes().await;
        targets.extend(seeds.iter().cloned());

        let cores = self.ping_peers(targets).await;
        if self.roles.role() == Role::Replicant {
            if let Some(core) = cores.first() {
                self.learn_tables(core).await;
            }
            self.shards.update_core_nodes(cores).await;
        }
    }

    /// Ping `targets` once, remembering their roles and (on a core)
    /// recording their liveness. Returns the running cores among them.
    async fn ping_peers(&self, mut targets: Vec<NodeName>) -> Vec<NodeName> {
        let role = self.roles.role();
        targets.sort();
        targets.dedup();
        targets.retain(|n| *n != self.node);

        let ping = |node: NodeName| async move {
            let reply = self
                .rpc
                .call(
                    &node,
                    Request::Ping {
                        from: self.node.clone(),
                        role,
                    },
                )
                .await;
            (node, reply)
        };
        let replies = join_all(targets.into_iter().map(ping)).await;

        let mut cores = Vec::new();
        for (node, reply) in replies {
            let up = match reply {
                Ok(Response::Pong {
                    role: peer_role,
                    storage_running,
                    ..
                }) => {
                    self.roles.remember(node.clone(), peer_role);
                    peer_role == Role::Core && storage_running
                }
                Ok(_) => false,
                Err(e) => {
                    tracing::trace!("Ping to {} failed: {}", node, e);
                    false
                }
            };
            if up {
                cores.push(node.clone());
            }
            if role == Role::Core {
                self.storage.record_peer_liveness(&node, up).await;
            }
        }
        cores
    }

    /// Replicants learn table placement from a core node
    async fn learn_tables(&self, core: &NodeName) {
        let entries = match rpc::call(self.rpc.as_ref(), core, Request::Tables).await {
            Ok(Response::Tables(entries)) => entries,
            Ok(other) => {
                tracing::debug!("Ignoring {} from {} to table query", other.type_name(), core);
                return;
            }
            Err(e) => {
                tracing::debug!("Table query to {} failed: {}", core, e);
                return;
            }
        };
        if let Err(e) = self.shards.merge_tables(entries).await {
            tracing::warn!("Conflicting table placement from {}: {}", core, e);
        }
    }
}

#[async_trait::async_trait]
impl Reconnect for Membership {
    /// Refresh peer liveness, then copy and load every missing table from
    /// whichever running peer has it
    async fn reconnect(&self, missing: &[String]) -> Result<()> {
        let peers = self.storage.db_nodes().await;
        self.ping_peers(peers).await;
        let sources = self.copy_sources(None).await;

        let mut known = self.shards.tables().await;
        if missing.iter().any(|t| !known.iter().any(|e| e.name == *t)) {
            if let Some(source) = sources.first() {
                self.learn_tables(source).await;
                known = self.shards.tables().await;
            }
        }

        for table in missing {
            let Some(entry) = known.iter().find(|e| e.name == *table) else {
                tracing::debug!("Placement of {} still unknown", table);
                continue;
            };
            match self.storage.copy_table(table, &entry.spec).await {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            if let Err(e) =
                fetch_table(self.rpc.as_ref(), self.storage.as_ref(), table, &sources).await
            {
                tracing::debug!("{} still not loaded: {}", table, e);
            }
        }
        Ok(())
    }
}
