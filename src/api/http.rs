//! HTTP API Server
//!
//! Admin REST API for cluster membership, topology queries, table
//! management and transactions.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::node::ClusterNode;
use crate::role::Role;
use crate::shard::ShardRegistry;
use crate::storage::{StorageBackend, StorageStatus};
use crate::types::{
    ClusterView, CopyType, DirtyOp, NodeFilter, NodeName, NodeStatus, Record, Shard,
    TableEntry, TableOptions, TxCall, Value,
};

/// Shared application state
pub struct AppState {
    /// The node served by this API
    pub node: Arc<ClusterNode>,
    /// When the API was created
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node: Arc<ClusterNode>) -> Self {
        let state = Arc::new(AppState {
            node,
            started_at: Instant::now(),
        });

        Self { config, state }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .route("/cluster", get(handle_cluster_view))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/nodes/:node", get(handle_node_status))
            // Membership
            .route("/cluster/join", post(handle_join))
            .route("/cluster/leave", post(handle_leave))
            .route("/cluster/remove", post(handle_remove))
            // Tables
            .route("/tables", post(handle_create_table))
            .route("/tables/:name/copy", post(handle_copy_table))
            // Transactions
            .route("/tx/ro", post(handle_ro_transaction))
            .route("/tx/rw", post(handle_transaction))
            .route("/dirty", post(handle_dirty))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Target node of a membership command
#[derive(Debug, Deserialize, Serialize)]
pub struct NodeRequest {
    pub node: String,
}

/// Leave request; without `via` any running peer is used
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LeaveRequest {
    #[serde(default)]
    pub via: Option<String>,
}

/// Node filter query
#[derive(Debug, Default, Deserialize)]
pub struct NodesQuery {
    #[serde(default)]
    pub filter: NodeFilter,
}

/// Table declaration
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTableRequest {
    pub name: String,
    /// Shard name; empty or "local_content" for the local-content shard
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub local_content: bool,
    #[serde(default)]
    pub copy_type: CopyType,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Copy request
#[derive(Debug, Deserialize, Serialize)]
pub struct CopyTableRequest {
    #[serde(default)]
    pub copy_type: CopyType,
}

/// Transaction request
#[derive(Debug, Deserialize, Serialize)]
pub struct TxRequest {
    pub shard: String,
    pub procedure: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Dirty operation request
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DirtyRequest {
    Write {
        table: String,
        key: serde_json::Value,
        value: serde_json::Value,
    },
    Delete {
        table: String,
        key: serde_json::Value,
    },
    DeleteObject {
        table: String,
        key: serde_json::Value,
        value: serde_json::Value,
    },
    ClearTable {
        table: String,
    },
}

impl From<DirtyRequest> for DirtyOp {
    fn from(req: DirtyRequest) -> Self {
        match req {
            DirtyRequest::Write { table, key, value } => DirtyOp::Write {
                table,
                record: Record::new(Value::from(key), Value::from(value)),
            },
            DirtyRequest::Delete { table, key } => DirtyOp::Delete {
                table,
                key: Value::from(key),
            },
            DirtyRequest::DeleteObject { table, key, value } => DirtyOp::DeleteObject {
                table,
                record: Record::new(Value::from(key), Value::from(value)),
            },
            DirtyRequest::ClearTable { table } => DirtyOp::ClearTable { table },
        }
    }
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node: NodeName,
    pub role: Role,
    pub storage: StorageStatus,
    pub schema_copy_type: CopyType,
    pub tables: Vec<TableEntry>,
    pub shards_up: Vec<String>,
    pub uptime_seconds: u64,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node: NodeName,
    pub role: Role,
}

/// Node status response
#[derive(Debug, Serialize)]
pub struct NodeStatusResponse {
    pub node: NodeName,
    pub status: NodeStatus,
}

/// Transaction result
#[derive(Debug, Serialize)]
pub struct ValueResponse {
    pub value: serde_json::Value,
}

/// Success response for commands without a result
#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub success: bool,
}

impl OkResponse {
    fn ok() -> Json<Self> {
        Json(Self { success: true })
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
}

/// Handler error carrying the crate error
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

/// HTTP status for an error class
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NodeNotInCluster
        | Error::NodeNotRunning(_)
        | Error::FailedToLeave { .. }
        | Error::FailedToConnectNode(_) => StatusCode::CONFLICT,
        Error::Transport(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::NoSuchTable(_) => StatusCode::NOT_FOUND,
        Error::StorageNotRunning | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::AlreadyExists(_) | Error::ReadOnlyWrite(_) => StatusCode::BAD_REQUEST,
        e if e.is_programming_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    let shards_up = node
        .shards()
        .shards_up()
        .await
        .iter()
        .map(Shard::to_string)
        .collect();

    Json(StatusResponse {
        node: node.name().clone(),
        role: node.role(),
        storage: node.storage().status().await,
        schema_copy_type: node.storage().schema_copy_type().await,
        tables: node.shards().tables().await,
        shards_up,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.node.storage().status().await == StorageStatus::Running;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            node: state.node.name().clone(),
            role: state.node.role(),
        }),
    )
}

async fn handle_cluster_view(State(state): State<Arc<AppState>>) -> Json<ClusterView> {
    Json(state.node.membership().cluster_view().await)
}

async fn handle_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NodesQuery>,
) -> Json<Vec<NodeName>> {
    Json(state.node.membership().cluster_nodes(query.filter).await)
}

async fn handle_node_status(
    State(state): State<Arc<AppState>>,
    Path(node): Path<String>,
) -> ApiResult<NodeStatusResponse> {
    let node = NodeName::new(node);
    match state.node.membership().cluster_status(&node).await {
        Some(status) => Ok(Json(NodeStatusResponse { node, status })),
        None => Err(Error::NodeNotInCluster.into()),
    }
}

async fn handle_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeRequest>,
) -> ApiResult<OkResponse> {
    state
        .node
        .membership()
        .join_cluster(&NodeName::new(req.node))
        .await?;
    Ok(OkResponse::ok())
}

async fn handle_leave(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LeaveRequest>,
) -> ApiResult<OkResponse> {
    let membership = state.node.membership();
    match req.via {
        Some(via) => membership.leave_cluster_via(&NodeName::new(via)).await?,
        None => membership.leave_cluster().await?,
    }
    Ok(OkResponse::ok())
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeRequest>,
) -> ApiResult<OkResponse> {
    state
        .node
        .membership()
        .remove_from_cluster(&NodeName::new(req.node))
        .await?;
    Ok(OkResponse::ok())
}

async fn handle_create_table(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTableRequest>,
) -> ApiResult<OkResponse> {
    let options = TableOptions {
        shard: req.shard.as_deref().map(Shard::parse),
        local_content: req.local_content,
        copy_type: req.copy_type,
        config: Value::from(req.config),
    };
    state.node.router().create_table(&req.name, &options).await?;
    Ok(OkResponse::ok())
}

async fn handle_copy_table(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<CopyTableRequest>,
) -> ApiResult<OkResponse> {
    state.node.router().copy_table(&name, req.copy_type).await?;
    Ok(OkResponse::ok())
}

async fn handle_ro_transaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TxRequest>,
) -> ApiResult<ValueResponse> {
    let call = TxCall::new(req.procedure, Value::from(req.args));
    let value = state
        .node
        .router()
        .ro_transaction(&Shard::parse(&req.shard), &call)
        .await?;
    Ok(Json(ValueResponse {
        value: value.to_json(),
    }))
}

async fn handle_transaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TxRequest>,
) -> ApiResult<ValueResponse> {
    let call = TxCall::new(req.procedure, Value::from(req.args));
    let value = state
        .node
        .router()
        .transaction(&Shard::parse(&req.shard), &call)
        .await?;
    Ok(Json(ValueResponse {
        value: value.to_json(),
    }))
}

async fn handle_dirty(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DirtyRequest>,
) -> ApiResult<OkResponse> {
    state.node.router().dirty(DirtyOp::from(req)).await?;
    Ok(OkResponse::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&Error::NodeNotInCluster), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::Transport(TransportError::Timeout(NodeName::from("a:1")))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&Error::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&Error::UnknownProcedure("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::Storage("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_dirty_request_parsing() {
        let req: DirtyRequest = serde_json::from_value(serde_json::json!({
            "op": "write",
            "table": "orders",
            "key": 7,
            "value": { "status": "paid" }
        }))
        .unwrap();

        match DirtyOp::from(req) {
            DirtyOp::Write { table, record } => {
                assert_eq!(table, "orders");
                assert_eq!(record.key, Value::Int(7));
                assert_eq!(record.value.get("status"), Some(&Value::from("paid")));
            }
            other => panic!("unexpected op: {}", other.name()),
        }
    }
}
