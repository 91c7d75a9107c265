//! Procedure Registry
//!
//! Transactions travel between nodes by name, so every node resolves a
//! `TxCall` against its own registry before running it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::storage::TxContext;
use crate::types::{Record, Value};

/// Transaction body callable by name
pub type Procedure = Arc<dyn Fn(&mut dyn TxContext, &Value) -> Result<Value> + Send + Sync>;

/// Named procedures available on this node
pub struct Procedures {
    procedures: RwLock<HashMap<String, Procedure>>,
}

impl Procedures {
    /// Registry with the built-in `kv.*` procedures
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register("kv.get", kv_get);
        registry.register("kv.put", kv_put);
        registry.register("kv.delete", kv_delete);
        registry.register("kv.keys", kv_keys);
        registry
    }

    /// Registry without any procedure
    pub fn empty() -> Self {
        Self {
            procedures: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a procedure
    pub fn register<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&mut dyn TxContext, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mut procedures = self.procedures.write().unwrap_or_else(|e| e.into_inner());
        procedures.insert(name.to_string(), Arc::new(procedure));
    }

    /// Look up a procedure
    pub fn get(&self, name: &str) -> Result<Procedure> {
        let procedures = self.procedures.read().unwrap_or_else(|e| e.into_inner());
        procedures
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProcedure(name.to_string()))
    }

    /// Registered procedure names, sorted
    pub fn names(&self) -> Vec<String> {
        let procedures = self.procedures.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = procedures.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Procedures {
    fn default() -> Self {
        Self::new()
    }
}

fn arg<'a>(args: &'a Value, field: &str) -> Result<&'a Value> {
    args.get(field)
        .ok_or_else(|| Error::InvalidArguments(format!("missing field `{}`", field)))
}

fn table_arg(args: &Value) -> Result<&str> {
    arg(args, "table")?
        .as_str()
        .ok_or_else(|| Error::InvalidArguments("`table` must be a string".into()))
}

/// `{table, key}` -> stored value or null
fn kv_get(ctx: &mut dyn TxContext, args: &Value) -> Result<Value> {
    let record = ctx.read(table_arg(args)?, arg(args, "key")?)?;
    Ok(record.map(|r| r.value).unwrap_or(Value::Null))
}

/// `{table, key, value}`
fn kv_put(ctx: &mut dyn TxContext, args: &Value) -> Result<Value> {
    let record = Record {
        key: arg(args, "key")?.clone(),
        value: arg(args, "value")?.clone(),
    };
    ctx.write(table_arg(args)?, record)?;
    Ok(Value::Null)
}

/// `{table, key}`
fn kv_delete(ctx: &mut dyn TxContext, args: &Value) -> Result<Value> {
    ctx.delete(table_arg(args)?, arg(args, "key")?)?;
    Ok(Value::Null)
}

/// `{table}` -> list of keys
fn kv_keys(ctx: &mut dyn TxContext, args: &Value) -> Result<Value> {
    Ok(Value::List(ctx.keys(table_arg(args)?)?))
}
