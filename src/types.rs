//! Core Types
//!
//! Identifiers and values shared by the membership manager, the router
//! and the RPC protocol.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Network-addressable node name. The name doubles as the node's RPC
/// address (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical partition of tables with its own replication stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Shard {
    /// Data that is never replicated and always served from local storage
    LocalContent,
    /// A replicated shard
    Named(String),
}

impl Shard {
    pub fn named(name: impl Into<String>) -> Self {
        Shard::Named(name.into())
    }

    pub fn is_local_content(&self) -> bool {
        matches!(self, Shard::LocalContent)
    }

    /// Parse the textual form used by the HTTP API and CLI.
    pub fn parse(s: &str) -> Self {
        match s {
            "local_content" | "" => Shard::LocalContent,
            other => Shard::Named(other.to_string()),
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shard::LocalContent => write!(f, "local_content"),
            Shard::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Identity of a replication session. Only ever compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a shard is currently streamed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// A session with `node` is established
    Connected {
        node: NodeName,
        session: SessionHandle,
    },
    /// No session; the shard is not being streamed
    Disconnected,
}

/// Dynamically typed value stored in tables and passed to procedures.
///
/// There is deliberately no float variant so values can be used as
/// ordered keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Field lookup for map values
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(field))
    }

    /// Convert to JSON for the HTTP API
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            // Non-integral numbers are kept as their textual form
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(m) => {
                Value::Map(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A keyed row. Tables hold at most one record per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Value,
    pub value: Value,
}

impl Record {
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How a table copy is held by the storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyType {
    #[default]
    Ram,
    Disc,
}

impl fmt::Display for CopyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyType::Ram => write!(f, "ram"),
            CopyType::Disc => write!(f, "disc"),
        }
    }
}

/// Validated table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Shard the table belongs to
    pub shard: Shard,
    /// Copy type of the local replica
    pub copy_type: CopyType,
    /// Storage-engine specific configuration, opaque to the router
    pub config: Value,
}

/// Caller-supplied table declaration, checked by `TableOptions::validate`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableOptions {
    #[serde(default)]
    pub shard: Option<Shard>,
    #[serde(default)]
    pub local_content: bool,
    #[serde(default)]
    pub copy_type: CopyType,
    #[serde(default)]
    pub config: Value,
}

impl TableOptions {
    /// Options for a table in a replicated shard
    pub fn sharded(shard: impl Into<String>) -> Self {
        Self {
            shard: Some(Shard::named(shard)),
            local_content: false,
            copy_type: CopyType::Ram,
            config: Value::Null,
        }
    }

    /// Options for a node-local table
    pub fn local_content() -> Self {
        Self {
            shard: None,
            local_content: true,
            copy_type: CopyType::Ram,
            config: Value::Null,
        }
    }

    pub fn with_copy_type(mut self, copy_type: CopyType) -> Self {
        self.copy_type = copy_type;
        self
    }

    /// Resolve the declaration into a spec.
    ///
    /// A local-content table must live in the local-content shard and a
    /// replicated table must name a real shard.
    pub fn validate(&self, table: &str) -> crate::Result<TableSpec> {
        let shard = match (&self.shard, self.local_content) {
            (None, true) | (Some(Shard::LocalContent), true) => Shard::LocalContent,
            (Some(Shard::Named(name)), false) => Shard::Named(name.clone()),
            (Some(Shard::Named(name)), true) => {
                return Err(crate::Error::InvalidTableDefinition {
                    table: table.to_string(),
                    reason: format!("local_content table assigned to shard {}", name),
                });
            }
            (None, false) | (Some(Shard::LocalContent), false) => {
                return Err(crate::Error::InvalidTableDefinition {
                    table: table.to_string(),
                    reason: "table doesn't belong to any shard".into(),
                });
            }
        };

        Ok(TableSpec {
            shard,
            copy_type: self.copy_type,
            config: self.config.clone(),
        })
    }
}

/// Table registered against a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub spec: TableSpec,
}

/// Named, remotely executable transaction body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxCall {
    /// Procedure name in the node's procedure registry
    pub procedure: String,
    /// Arguments handed to the procedure
    pub args: Value,
}

impl TxCall {
    pub fn new(procedure: impl Into<String>, args: Value) -> Self {
        Self {
            procedure: procedure.into(),
            args,
        }
    }
}

/// Non-transactional table operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirtyOp {
    Write { table: String, record: Record },
    Delete { table: String, key: Value },
    DeleteObject { table: String, record: Record },
    ClearTable { table: String },
}

impl DirtyOp {
    pub fn table(&self) -> &str {
        match self {
            DirtyOp::Write { table, .. }
            | DirtyOp::Delete { table, .. }
            | DirtyOp::DeleteObject { table, .. }
            | DirtyOp::ClearTable { table } => table,
        }
    }

    /// Operation name (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            DirtyOp::Write { .. } => "dirty_write",
            DirtyOp::Delete { .. } => "dirty_delete",
            DirtyOp::DeleteObject { .. } => "dirty_delete_object",
            DirtyOp::ClearTable { .. } => "clear_table",
        }
    }
}

/// Selector for `cluster_nodes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFilter {
    #[default]
    All,
    Running,
    Stopped,
}

/// Membership state of a node that is part of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of cluster topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub running_nodes: Vec<NodeName>,
    pub stopped_nodes: Vec<NodeName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_options_validation() {
        let spec = TableOptions::sharded("sh1").validate("orders").unwrap();
        assert_eq!(spec.shard, Shard::named("sh1"));

        let spec = TableOptions::local_content().validate("cache").unwrap();
        assert_eq!(spec.shard, Shard::LocalContent);

        let mut bad = TableOptions::sharded("sh1");
        bad.local_content = true;
        assert!(matches!(
            bad.validate("orders"),
            Err(crate::Error::InvalidTableDefinition { .. })
        ));

        let orphan = TableOptions::default();
        assert!(orphan.validate("orders").unwrap_err().is_programming_error());
    }

    #[test]
    fn test_table_options_defaults() {
        let options = TableOptions::default();
        assert_eq!(options.config, Value::Null);
        assert_eq!(options.copy_type, CopyType::Ram);

        let parsed: TableOptions = serde_json::from_str(r#"{"shard": {"Named": "sh1"}}"#).unwrap();
        assert_eq!(parsed.config, Value::Null);
        assert_eq!(parsed.validate("orders").unwrap().config, Value::Null);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"id": 7, "tags": ["a", "b"], "ok": true});
        let value = Value::from(json.clone());
        assert_eq!(value.get("id"), Some(&Value::Int(7)));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_shard_parse() {
        assert_eq!(Shard::parse("local_content"), Shard::LocalContent);
        assert_eq!(Shard::parse("sh1"), Shard::named("sh1"));
        assert_eq!(Shard::named("sh1").to_string(), "sh1");
    }
}
