//! Request dispatcher
//!
//! Serves requests arriving from other nodes, whatever the transport.

use std::sync::Arc;

use super::{Request, Response};
use crate::cluster::Membership;
use crate::error::Result;
use crate::role::{Role, RoleOracle};
use crate::router::Router;
use crate::shard::ShardRegistry;
use crate::storage::{StorageBackend, StorageStatus, TxKind};
use crate::types::NodeName;

/// Answers RPC requests on behalf of one node
pub struct Dispatcher {
    node: NodeName,
    roles: Arc<dyn RoleOracle>,
    storage: Arc<dyn StorageBackend>,
    shards: Arc<dyn ShardRegistry>,
    membership: Arc<Membership>,
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(
        node: NodeName,
        roles: Arc<dyn RoleOracle>,
        storage: Arc<dyn StorageBackend>,
        shards: Arc<dyn ShardRegistry>,
        membership: Arc<Membership>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            node,
            roles,
            storage,
            shards,
            membership,
            router,
        }
    }

    /// Handle one request. Failures are turned into `Response::Failed`.
    pub async fn handle(&self, request: Request) -> Response {
        let name = request.type_name();
        match self.serve(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} on {} failed: {}", name, self.node, e);
                Response::failed(&e)
            }
        }
    }

    async fn serve(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::Ping { from, role } => {
                self.roles.remember(from.clone(), role);
                let local = self.roles.role();
                if local == Role::Core && role == Role::Replicant {
                    self.shards.attach_replicant(&from).await;
                }
                Response::Pong {
                    node: self.node.clone(),
                    role: local,
                    storage_running: self.storage.status().await == StorageStatus::Running,
                }
            }

            Request::Role => Response::Role(self.roles.role()),

            Request::RunningNodes => Response::Nodes(self.membership.running_nodes().await),

            Request::Replicants => Response::Nodes(self.shards.attached_replicants().await),

            Request::Tables => Response::Tables(self.shards.tables().await),

            Request::TableRecords { table } => {
                Response::Records(self.storage.table_records(&table).await?)
            }

            Request::AddPeer { node } => Response::Nodes(self.membership.add_peer(&node).await?),

            Request::DelSchemaCopy { node } => {
                self.membership.del_schema_copy(&node).await?;
                Response::Ok
            }

            Request::StopStorage => {
                self.membership.ensure_stopped().await?;
                Response::Ok
            }

            Request::DeleteSchema => {
                self.membership.delete_schema().await?;
                Response::Ok
            }

            Request::RoTransaction { shard, call } => {
                Response::Value(self.router.ro_transaction(&shard, &call).await?)
            }

            // Writes forwarded here execute on this node's storage
            Request::Transaction { call, .. } => {
                Response::Value(self.router.run_local(TxKind::ReadWrite, &call).await?)
            }

            Request::Dirty(op) => {
                self.router.apply_local(&op).await?;
                Response::Ok
            }
        };
        Ok(response)
    }
}
