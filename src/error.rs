//! Replicore Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeName;

/// Result type alias for Replicore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a remote call itself, as opposed to a failure reported by
/// the remote node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("badrpc: {node} unreachable: {reason}")]
    Unreachable { node: NodeName, reason: String },

    #[error("badrpc: call to {0} timed out")]
    Timeout(NodeName),

    #[error("badrpc: protocol error talking to {node}: {reason}")]
    Protocol { node: NodeName, reason: String },
}

/// Replicore error types
#[derive(Error, Debug)]
pub enum Error {
    // Topology errors
    #[error("Node is not in the cluster")]
    NodeNotInCluster,

    #[error("Node not running: {0}")]
    NodeNotRunning(NodeName),

    #[error("Failed to leave the cluster via any of {remaining:?}")]
    FailedToLeave { remaining: Vec<NodeName> },

    #[error("Failed to connect node: {0}")]
    FailedToConnectNode(NodeName),

    // Transport errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Storage errors, passed through verbatim
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage is not running")]
    StorageNotRunning,

    #[error("Storage unexpectedly stopped")]
    StorageUnexpectedlyStopped,

    #[error("Storage unexpectedly running")]
    StorageUnexpectedlyRunning,

    #[error("No such table: {0}")]
    NoSuchTable(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Write to {0} inside a read-only transaction")]
    ReadOnlyWrite(String),

    // Programming errors
    #[error("Invalid definition for table {table}: {reason}")]
    InvalidTableDefinition { table: String, reason: String },

    #[error("Unknown procedure: {0}")]
    UnknownProcedure(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Operation cannot target the local node {0}")]
    SelfTarget(NodeName),

    // Remote failure that has no local counterpart
    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // I/O and encoding errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Error codes carried in RPC failure responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NodeNotInCluster,
    NodeNotRunning,
    FailedToLeave,
    FailedToConnectNode,
    Transport,
    Timeout,
    Storage,
    StorageNotRunning,
    NoSuchTable,
    AlreadyExists,
    ReadOnlyWrite,
    InvalidTableDefinition,
    UnknownProcedure,
    InvalidArguments,
    Internal,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Timeout(_)
                | Error::NodeNotRunning(_)
                | Error::FailedToConnectNode(_)
                | Error::FailedToLeave { .. }
        )
    }

    /// Check if this error indicates a bug in the caller
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidTableDefinition { .. }
                | Error::UnknownProcedure(_)
                | Error::InvalidArguments(_)
                | Error::SelfTarget(_)
        )
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NodeNotInCluster => ErrorCode::NodeNotInCluster,
            Error::NodeNotRunning(_) => ErrorCode::NodeNotRunning,
            Error::FailedToLeave { .. } => ErrorCode::FailedToLeave,
            Error::FailedToConnectNode(_) => ErrorCode::FailedToConnectNode,
            Error::Transport(_) => ErrorCode::Transport,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Storage(_)
            | Error::StorageUnexpectedlyStopped
            | Error::StorageUnexpectedlyRunning => ErrorCode::Storage,
            Error::StorageNotRunning => ErrorCode::StorageNotRunning,
            Error::NoSuchTable(_) => ErrorCode::NoSuchTable,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::ReadOnlyWrite(_) => ErrorCode::ReadOnlyWrite,
            Error::InvalidTableDefinition { .. } => ErrorCode::InvalidTableDefinition,
            Error::UnknownProcedure(_) => ErrorCode::UnknownProcedure,
            Error::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Error::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild an error reported by a remote node.
    ///
    /// Storage failures keep their message so callers see the backend's
    /// reason unchanged. Structured topology errors only survive as
    /// `Remote` since their payload is not carried on the wire.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NodeNotInCluster => Error::NodeNotInCluster,
            ErrorCode::Timeout => Error::Timeout(message),
            ErrorCode::Storage => Error::Storage(message),
            ErrorCode::StorageNotRunning => Error::StorageNotRunning,
            ErrorCode::NoSuchTable => Error::NoSuchTable(message),
            ErrorCode::AlreadyExists => Error::AlreadyExists(message),
            ErrorCode::ReadOnlyWrite => Error::ReadOnlyWrite(message),
            ErrorCode::UnknownProcedure => Error::UnknownProcedure(message),
            ErrorCode::InvalidArguments => Error::InvalidArguments(message),
            code => Error::Remote { code, message },
        }
    }

    /// Message sent alongside the code on the wire
    pub fn wire_message(&self) -> String {
        match self {
            Error::Storage(m)
            | Error::Timeout(m)
            | Error::NoSuchTable(m)
            | Error::AlreadyExists(m)
            | Error::ReadOnlyWrite(m)
            | Error::UnknownProcedure(m)
            | Error::InvalidArguments(m) => m.clone(),
            other => other.to_string(),
        }
    }
}
