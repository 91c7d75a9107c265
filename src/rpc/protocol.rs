//! RPC Protocol
//!
//! Defines the wire protocol for calls between nodes.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::role::Role;
use crate::types::{DirtyOp, NodeName, Record, Shard, TableEntry, TxCall, Value};

/// Requests a node can serve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // ========== Liveness ==========
    /// Liveness probe; replicants pinging a core attach to it
    Ping { from: NodeName, role: Role },

    /// Role of the serving node
    Role,

    // ========== Topology ==========
    /// Full `running_nodes` view of the serving node
    RunningNodes,

    /// Replicants attached to the serving (core) node
    Replicants,

    /// Table -> shard assignments known to the serving node
    Tables,

    /// Contents of a table the serving node has loaded
    TableRecords { table: String },

    // ========== Membership ==========
    /// Register `node` as an extra schema peer
    AddPeer { node: NodeName },

    /// Drop `node`'s schema copy
    DelSchemaCopy { node: NodeName },

    /// Stop the serving node's storage
    StopStorage,

    /// Delete the serving node's schema
    DeleteSchema,

    // ========== Transactions ==========
    /// Read-only transaction, routed by the serving node
    RoTransaction { shard: Shard, call: TxCall },

    /// Read-write transaction, executed on the serving node's storage
    Transaction { shard: Shard, call: TxCall },

    /// Dirty operation, executed on the serving node's storage
    Dirty(DirtyOp),
}

/// Replies to `Request`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,

    Pong {
        node: NodeName,
        role: Role,
        storage_running: bool,
    },

    Role(Role),

    Nodes(Vec<NodeName>),

    Tables(Vec<TableEntry>),

    Records(Vec<Record>),

    Value(Value),

    /// The request reached the node but failed there
    Failed { code: ErrorCode, message: String },
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "Ping",
            Request::Role => "Role",
            Request::RunningNodes => "RunningNodes",
            Request::Replicants => "Replicants",
            Request::Tables => "Tables",
            Request::TableRecords { .. } => "TableRecords",
            Request::AddPeer { .. } => "AddPeer",
            Request::DelSchemaCopy { .. } => "DelSchemaCopy",
            Request::StopStorage => "StopStorage",
            Request::DeleteSchema => "DeleteSchema",
            Request::RoTransaction { .. } => "RoTransaction",
            Request::Transaction { .. } => "Transaction",
            Request::Dirty(_) => "Dirty",
        }
    }
}

impl Response {
    /// Get the response type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Ok => "Ok",
            Response::Pong { .. } => "Pong",
            Response::Role(_) => "Role",
            Response::Nodes(_) => "Nodes",
            Response::Tables(_) => "Tables",
            Response::Records(_) => "Records",
            Response::Value(_) => "Value",
            Response::Failed { .. } => "Failed",
        }
    }

    pub fn failed(err: &crate::Error) -> Self {
        Response::Failed {
            code: err.code(),
            message: err.wire_message(),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
