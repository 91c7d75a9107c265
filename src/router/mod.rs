//! Transaction Router
//!
//! Decides per call whether a transaction or dirty operation runs against
//! local storage, runs locally under a session recheck, or is forwarded
//! to a core node over RPC.

mod procedures;
mod retry;

pub use procedures::{Procedure, Procedures};
pub use retry::{NoBackoff, RetryHook};

use std::sync::Arc;
use std::time::Duration;

use crate::cluster::fetch_table;
use crate::error::{Error, Result};
use crate::role::{Role, RoleOracle};
use crate::rpc::{self, Request, Rpc};
use crate::shard::ShardRegistry;
use crate::storage::{StorageBackend, TxContext, TxKind};
use crate::types::{
    CopyType, DirtyOp, NodeName, Record, Shard, TableOptions, TxCall, Upstream, Value,
};

/// Default bound on waiting for a core node of a shard
pub const DEFAULT_CORE_NODE_WAIT: Duration = Duration::from_millis(5000);

/// Where a write executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Local,
    Remote(NodeName),
}

/// Shard-aware transaction router of one node
pub struct Router {
    node: NodeName,
    roles: Arc<dyn RoleOracle>,
    shards: Arc<dyn ShardRegistry>,
    storage: Arc<dyn StorageBackend>,
    rpc: Arc<dyn Rpc>,
    procedures: Arc<Procedures>,
    retry: Arc<dyn RetryHook>,
    core_node_wait: Duration,
}

impl Router {
    pub fn new(
        node: NodeName,
        roles: Arc<dyn RoleOracle>,
        shards: Arc<dyn ShardRegistry>,
        storage: Arc<dyn StorageBackend>,
        rpc: Arc<dyn Rpc>,
        procedures: Arc<Procedures>,
    ) -> Self {
        Self {
            node,
            roles,
            shards,
            storage,
            rpc,
            procedures,
            retry: Arc::new(NoBackoff),
            core_node_wait: DEFAULT_CORE_NODE_WAIT,
        }
    }

    pub fn with_retry_hook(mut self, retry: Arc<dyn RetryHook>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_core_node_wait(mut self, wait: Duration) -> Self {
        self.core_node_wait = wait;
        self
    }

    pub fn procedures(&self) -> &Arc<Procedures> {
        &self.procedures
    }

    // ========== Read-only transactions ==========

    /// Run a read-only transaction against `shard`.
    ///
    /// On a replicant with an established session the result is only
    /// returned if the session handle is the same before and after the
    /// run; otherwise the whole transaction starts over.
    pub async fn ro_transaction(&self, shard: &Shard, call: &TxCall) -> Result<Value> {
        if shard.is_local_content() || self.roles.role() == Role::Core {
            return self.run_local(TxKind::ReadOnly, call).await;
        }

        let mut attempt: u32 = 0;
        loop {
            let session = match self.shards.upstream(shard).await {
                Upstream::Disconnected => {
                    tracing::debug!("Shard {} is down, {} goes over RPC", shard, call.procedure);
                    return self.ro_trans_rpc(shard, call).await;
                }
                Upstream::Connected { session, .. } => session,
            };

            let result = self.run_local(TxKind::ReadOnly, call).await;

            if self.shards.session_handle(shard).await == Some(session) {
                return result;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.retry.before_retry(shard, attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Run a read-only transaction on a core node serving `shard`
    pub async fn ro_trans_rpc(&self, shard: &Shard, call: &TxCall) -> Result<Value> {
        let core = self.shards.get_core_node(shard, self.core_node_wait).await?;
        tracing::trace!("Forwarding read-only {} to {}", call.procedure, core);

        rpc::call_value(
            self.rpc.as_ref(),
            &core,
            Request::RoTransaction {
                shard: shard.clone(),
                call: call.clone(),
            },
        )
        .await
    }

    // ========== Writes ==========

    /// Run a read-write transaction on the write backend of `shard`.
    /// The backend's result is returned as is.
    pub async fn transaction(&self, shard: &Shard, call: &TxCall) -> Result<Value> {
        match self.write_backend(shard).await? {
            Backend::Local => self.run_local(TxKind::ReadWrite, call).await,
            Backend::Remote(core) => {
                tracing::trace!("Forwarding {} to {}", call.procedure, core);
                rpc::call_value(
                    self.rpc.as_ref(),
                    &core,
                    Request::Transaction {
                        shard: shard.clone(),
                        call: call.clone(),
                    },
                )
                .await
            }
        }
    }

    pub async fn dirty_write(&self, table: &str, record: Record) -> Result<()> {
        self.dirty(DirtyOp::Write {
            table: table.to_string(),
            record,
        })
        .await
    }

    pub async fn dirty_delete(&self, table: &str, key: Value) -> Result<()> {
        self.dirty(DirtyOp::Delete {
            table: table.to_string(),
            key,
        })
        .await
    }

    pub async fn dirty_delete_object(&self, table: &str, record: Record) -> Result<()> {
        self.dirty(DirtyOp::DeleteObject {
            table: table.to_string(),
            record,
        })
        .await
    }

    pub async fn clear_table(&self, table: &str) -> Result<()> {
        self.dirty(DirtyOp::ClearTable {
            table: table.to_string(),
        })
        .await
    }

    /// Dispatch a dirty operation to the write backend of its table's shard
    pub async fn dirty(&self, op: DirtyOp) -> Result<()> {
        // Tables without a shard are node-local
        let shard = self
            .shards
            .shard_of(op.table())
            .await
            .unwrap_or(Shard::LocalContent);

        match self.write_backend(&shard).await? {
            Backend::Local => self.apply_local(&op).await,
            Backend::Remote(core) => {
                tracing::trace!("Forwarding {} on {} to {}", op.name(), op.table(), core);
                rpc::call_unit(self.rpc.as_ref(), &core, Request::Dirty(op)).await
            }
        }
    }

    /// Local dirty read; never leaves the node
    pub async fn dirty_read(&self, table: &str, key: &Value) -> Result<Option<Record>> {
        self.storage.dirty_read(table, key).await
    }

    /// Resolve where writes to `shard` execute
    pub async fn write_backend(&self, shard: &Shard) -> Result<Backend> {
        if shard.is_local_content() || self.roles.role() == Role::Core {
            return Ok(Backend::Local);
        }
        match self.shards.upstream(shard).await {
            Upstream::Connected { node, .. } => Ok(Backend::Remote(node)),
            Upstream::Disconnected => {
                let core = self.shards.get_core_node(shard, self.core_node_wait).await?;
                Ok(Backend::Remote(core))
            }
        }
    }

    // ========== Tables ==========

    /// Create a table and register it against its shard.
    ///
    /// The table is registered only once it exists in storage.
    pub async fn create_table(&self, table: &str, options: &TableOptions) -> Result<()> {
        let spec = options.validate(table)?;

        match self.storage.create_table(table, &spec).await {
            Ok(()) => tracing::info!("Created table {} in shard {}", table, spec.shard),
            Err(Error::AlreadyExists(_)) => {
                tracing::debug!("Table {} already exists", table);
            }
            Err(e) => return Err(e),
        }

        self.shards.add_table(&spec.shard, table, &spec).await
    }

    /// Add a local copy of a table known to the shard registry
    pub async fn copy_table(&self, table: &str, copy_type: CopyType) -> Result<()> {
        let mut spec = self
            .shards
            .tables()
            .await
            .into_iter()
            .find(|entry| entry.name == table)
            .map(|entry| entry.spec)
            .ok_or_else(|| Error::NoSuchTable(table.to_string()))?;
        spec.copy_type = copy_type;

        match self.storage.copy_table(table, &spec).await {
            Ok(()) => {}
            Err(Error::AlreadyExists(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        let sources: Vec<NodeName> = self
            .storage
            .running_db_nodes()
            .await
            .into_iter()
            .filter(|n| *n != self.node)
            .collect();
        if sources.is_empty() {
            // No running peer holds the table, so the copy starts empty
            self.storage.load_table(table, Vec::new()).await?;
        } else {
            fetch_table(self.rpc.as_ref(), self.storage.as_ref(), table, &sources).await?;
        }

        tracing::info!("Added {} copy of {} on {}", copy_type, table, self.node);
        Ok(())
    }

    // ========== Local execution ==========

    /// Run a named procedure in a local transaction
    pub async fn run_local(&self, kind: TxKind, call: &TxCall) -> Result<Value> {
        let procedure = self.procedures.get(&call.procedure)?;
        let args = &call.args;
        self.storage
            .transaction(kind, &move |ctx: &mut dyn TxContext| procedure(ctx, args))
            .await
    }

    /// Apply a dirty operation to local storage
    pub async fn apply_local(&self, op: &DirtyOp) -> Result<()> {
        match op {
            DirtyOp::Write { table, record } => self.storage.dirty_write(table, record.clone()).await,
            DirtyOp::Delete { table, key } => self.storage.dirty_delete(table, key).await,
            DirtyOp::DeleteObject { table, record } => {
                self.storage.dirty_delete_object(table, record).await
            }
            DirtyOp::ClearTable { table } => self.storage.clear_table(table).await,
        }
    }
}
