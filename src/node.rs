//! Node Assembly
//!
//! Wires storage, shard registry, role oracle, membership manager, router
//! and dispatcher into one node, boots its storage and runs the liveness
//! loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::cluster::{Membership, WaitConfig};
use crate::config::ReplicoreConfig;
use crate::error::Result;
use crate::role::{ConfiguredRoles, Role, RoleOracle};
use crate::router::{Procedures, Router, DEFAULT_CORE_NODE_WAIT};
use crate::rpc::{Dispatcher, Rpc};
use crate::shard::{LocalShardRegistry, ShardRegistry};
use crate::storage::{MemoryStorage, StorageBackend};
use crate::types::NodeName;

/// Settings needed to assemble a node
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: NodeName,
    pub role: Role,
    /// Where the disc schema lives (None = memory only)
    pub data_dir: Option<PathBuf>,
    pub seeds: Vec<NodeName>,
    pub heartbeat_interval: Duration,
    pub core_node_wait: Duration,
    pub wait: WaitConfig,
}

impl NodeOptions {
    /// Memory-only node with default timings
    pub fn new(name: impl Into<NodeName>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            data_dir: None,
            seeds: Vec::new(),
            heartbeat_interval: Duration::from_secs(1),
            core_node_wait: DEFAULT_CORE_NODE_WAIT,
            wait: WaitConfig::default(),
        }
    }

    pub fn from_config(config: &ReplicoreConfig) -> Self {
        Self {
            name: config.node_name(),
            role: config.node.role,
            data_dir: Some(config.data_dir().clone()),
            seeds: config.seeds(),
            heartbeat_interval: config.heartbeat_interval(),
            core_node_wait: config.core_node_wait(),
            wait: WaitConfig::from(&config.storage),
        }
    }

    /// Replicant attachments expire after three missed heartbeats
    fn replicant_lease(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// A fully wired node
pub struct ClusterNode {
    options: NodeOptions,
    storage: Arc<MemoryStorage>,
    shards: Arc<LocalShardRegistry>,
    roles: Arc<ConfiguredRoles>,
    membership: Arc<Membership>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
}

impl ClusterNode {
    /// Assemble a node that reaches its peers through `rpc`
    pub fn build(options: NodeOptions, rpc: Arc<dyn Rpc>) -> Self {
        let name = options.name.clone();

        let storage = Arc::new(match &options.data_dir {
            Some(dir) => MemoryStorage::with_data_dir(name.clone(), dir.clone()),
            None => MemoryStorage::new(name.clone()),
        });
        let shards = Arc::new(LocalShardRegistry::new(options.replicant_lease()));
        let roles = Arc::new(ConfiguredRoles::new(name.clone(), options.role, Arc::clone(&rpc)));

        let membership = Arc::new(Membership::new(
            name.clone(),
            roles.clone(),
            storage.clone(),
            shards.clone(),
            Arc::clone(&rpc),
            options.wait.clone(),
        ));
        let router = Arc::new(
            Router::new(
                name.clone(),
                roles.clone(),
                shards.clone(),
                storage.clone(),
                rpc,
                Arc::new(Procedures::new()),
            )
            .with_core_node_wait(options.core_node_wait),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            name,
            roles.clone(),
            storage.clone(),
            shards.clone(),
            Arc::clone(&membership),
            Arc::clone(&router),
        ));

        let (shutdown, _) = watch::channel(false);

        Self {
            options,
            storage,
            shards,
            roles,
            membership,
            router,
            dispatcher,
            shutdown,
        }
    }

    /// Boot local storage.
    ///
    /// A core node without an on-disk schema creates one first. Table
    /// assignments are rebuilt from whatever the storage loaded.
    pub async fn start(&self) -> Result<()> {
        if self.options.role == Role::Core && !self.storage.has_disc_schema() {
            self.storage.create_schema().await?;
        }
        self.membership.ensure_started().await?;

        let tables = self.storage.table_entries().await;
        let count = tables.len();
        self.shards.merge_tables(tables).await?;

        tracing::info!(
            "Node {} ({}) started with {} tables",
            self.options.name,
            self.options.role,
            count
        );
        Ok(())
    }

    /// Probe peers every heartbeat until `shutdown` is called
    pub fn spawn_liveness(&self) -> JoinHandle<()> {
        let membership = Arc::clone(&self.membership);
        let seeds = self.options.seeds.clone();
        let mut ticker = interval(self.options.heartbeat_interval);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            tracing::debug!("Liveness loop started on {}", membership.node());
            loop {
                tokio::select! {
                    _ = ticker.tick() => membership.probe_peers(&seeds).await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Liveness loop stopped on {}", membership.node());
        })
    }

    /// Stop background tasks and local storage
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.storage.stop().await
    }

    pub fn name(&self) -> &NodeName {
        &self.options.name
    }

    pub fn role(&self) -> Role {
        self.roles.role()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn shards(&self) -> &Arc<LocalShardRegistry> {
        &self.shards
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
