//! Table content transfer between schema peers

use crate::error::{Error, Result};
use crate::rpc::{self, Request, Rpc};
use crate::storage::StorageBackend;
use crate::types::NodeName;

/// Load the contents of `table` from the first of `sources` that has it
/// loaded. Returns the peer the records came from.
pub async fn fetch_table(
    rpc: &dyn Rpc,
    storage: &dyn StorageBackend,
    table: &str,
    sources: &[NodeName],
) -> Result<NodeName> {
    let mut last_error = None;

    for source in sources {
        let request = Request::TableRecords {
            table: table.to_string(),
        };
        match rpc::call_records(rpc, source, request).await {
            Ok(records) => {
                let count = records.len();
                storage.load_table(table, records).await?;
                tracing::info!("Copied {} records of {} from {}", count, table, source);
                return Ok(source.clone());
            }
            Err(e) => {
                tracing::debug!("{} could not serve {}: {}", source, table, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Storage(format!("no running peer to copy {} from", table))))
}
