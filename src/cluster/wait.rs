//! Storage wait primitives

use std::time::Duration;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StorageStatus, TableWait};

/// Polling and timeout settings for storage waits
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Poll interval while storage is starting or stopping
    pub poll_interval: Duration,
    /// Length of one table wait round
    pub table_wait_timeout: Duration,
    /// Maximum table wait rounds (0 = unlimited)
    pub table_wait_rounds: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            table_wait_timeout: Duration::from_secs(30),
            table_wait_rounds: 0,
        }
    }
}

impl From<&StorageConfig> for WaitConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            table_wait_timeout: Duration::from_millis(config.table_wait_timeout_ms),
            table_wait_rounds: config.table_wait_rounds,
        }
    }
}

/// Wait until storage reaches `target` (`Running` or `Stopped`).
///
/// Transitional states keep polling. Landing in the opposite steady state
/// is an error.
pub async fn wait_for(
    storage: &dyn StorageBackend,
    target: StorageStatus,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        let status = storage.status().await;
        if status == target {
            return Ok(());
        }
        match (status, target) {
            (StorageStatus::Stopped, StorageStatus::Running) => {
                return Err(Error::StorageUnexpectedlyStopped);
            }
            (StorageStatus::Running, StorageStatus::Stopped) => {
                return Err(Error::StorageUnexpectedlyRunning);
            }
            _ => tokio::time::sleep(poll_interval).await,
        }
    }
}

/// Corrective step run between table wait rounds
#[async_trait::async_trait]
pub trait Reconnect: Send + Sync {
    /// Re-establish contact with peers and retry loading `missing`
    async fn reconnect(&self, missing: &[String]) -> Result<()>;
}

/// Wait until every table in `tables` is loaded locally.
///
/// After each timed-out round the missing tables are logged, `reconnect`
/// gets a chance to load them and only the missing tables are waited for
/// again.
pub async fn wait_for_tables(
    storage: &dyn StorageBackend,
    tables: Vec<String>,
    reconnect: &dyn Reconnect,
    config: &WaitConfig,
) -> Result<()> {
    let mut pending = tables;
    let mut round: u32 = 0;

    loop {
        match storage
            .wait_for_tables(&pending, config.table_wait_timeout)
            .await?
        {
            TableWait::Ready => return Ok(()),
            TableWait::Timeout(missing) => {
                round = round.saturating_add(1);
                tracing::warn!(
                    "Timeout waiting for tables {:?} (round {}), reconnecting peers",
                    missing,
                    round
                );
                if config.table_wait_rounds != 0 && round >= config.table_wait_rounds {
                    return Err(Error::Timeout(format!("tables not loaded: {:?}", missing)));
                }
                reconnect.reconnect(&missing).await?;
                pending = missing;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::storage::MemoryStorage;
    use crate::types::{NodeName, Record, TableOptions, Value};

    struct NoPeers;

    #[async_trait::async_trait]
    impl Reconnect for NoPeers {
        async fn reconnect(&self, _missing: &[String]) -> Result<()> {
            Ok(())
        }
    }

    /// Loads whatever is missing, as a peer holding the data would
    struct LoadOnReconnect {
        storage: Arc<MemoryStorage>,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Reconnect for LoadOnReconnect {
        async fn reconnect(&self, missing: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for table in missing {
                self.storage
                    .load_table(table, vec![Record::new(1, "paid")])
                    .await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_for_steady_states() {
        let storage = MemoryStorage::new(NodeName::from("a:4370"));
        let poll = Duration::from_millis(10);

        wait_for(&storage, StorageStatus::Stopped, poll).await.unwrap();
        assert!(matches!(
            wait_for(&storage, StorageStatus::Running, poll).await,
            Err(Error::StorageUnexpectedlyStopped)
        ));

        storage.start().await.unwrap();
        wait_for(&storage, StorageStatus::Running, poll).await.unwrap();
        assert!(matches!(
            wait_for(&storage, StorageStatus::Stopped, poll).await,
            Err(Error::StorageUnexpectedlyRunning)
        ));
    }

    #[tokio::test]
    async fn test_table_wait_gives_up_after_rounds() {
        let storage = MemoryStorage::new(NodeName::from("a:4370"));
        storage.start().await.unwrap();

        let config = WaitConfig {
            poll_interval: Duration::from_millis(10),
            table_wait_timeout: Duration::from_millis(20),
            table_wait_rounds: 2,
        };
        let result = wait_for_tables(&storage, vec!["orders".into()], &NoPeers, &config).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        wait_for_tables(&storage, Vec::new(), &NoPeers, &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_table_wait_reconnects_between_rounds() {
        let storage = Arc::new(MemoryStorage::new(NodeName::from("a:4370")));
        storage.start().await.unwrap();
        let spec = TableOptions::sharded("sh1").validate("orders").unwrap();
        storage.copy_table("orders", &spec).await.unwrap();

        let config = WaitConfig {
            poll_interval: Duration::from_millis(10),
            table_wait_timeout: Duration::from_millis(20),
            table_wait_rounds: 3,
        };
        let loader = LoadOnReconnect {
            storage: Arc::clone(&storage),
            calls: AtomicU32::new(0),
        };

        wait_for_tables(storage.as_ref(), vec!["orders".into()], &loader, &config)
            .await
            .unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            storage.dirty_read("orders", &Value::from(1)).await.unwrap(),
            Some(Record::new(1, "paid"))
        );
    }
}
