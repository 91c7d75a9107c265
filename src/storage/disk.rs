//! Disk Store
//!
//! SQLite-backed persistence for the parts of the local schema that
//! outlive a restart: table definitions, schema peers and the records of
//! disc-copy tables.

use std::path::{Path, PathBuf};
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use crate::types::{NodeName, Record, TableSpec, Value};
use crate::error::Result;

const SCHEMA_FILE: &str = "schema.db";

/// Persistent schema store backed by SQLite
pub struct DiskStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Path of the database file
    path: PathBuf,
}

impl DiskStore {
    /// Create or open the schema database in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let path = data_dir.join(SCHEMA_FILE);
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_tables (
                name TEXT PRIMARY KEY,
                spec BLOB NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS schema_peers (
                node TEXT PRIMARY KEY,
                added_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS records (
                table_name TEXT NOT NULL,
                record_key BLOB NOT NULL,
                record BLOB NOT NULL,
                PRIMARY KEY (table_name, record_key)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Whether a schema has been persisted in `data_dir`
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(SCHEMA_FILE).exists()
    }

    /// Remove the schema database from `data_dir`
    pub fn destroy(data_dir: &Path) -> Result<()> {
        let path = data_dir.join(SCHEMA_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a table definition
    pub async fn save_table(&self, name: &str, spec: &TableSpec) -> Result<()> {
        let blob = bincode::serialize(spec)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO schema_tables (name, spec) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET spec = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![name, blob],
        )?;
        Ok(())
    }

    /// Load all persisted table definitions
    pub async fn load_tables(&self) -> Result<Vec<(String, TableSpec)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name, spec FROM schema_tables ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut tables = Vec::new();
        for row in rows {
            let (name, blob) = row?;
            tables.push((name, bincode::deserialize(&blob)?));
        }
        Ok(tables)
    }

    pub async fn save_peer(&self, node: &NodeName) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO schema_peers (node) VALUES (?1)",
            params![node.as_str()],
        )?;
        Ok(())
    }

    pub async fn remove_peer(&self, node: &NodeName) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM schema_peers WHERE node = ?1",
            params![node.as_str()],
        )?;
        Ok(())
    }

    pub async fn load_peers(&self) -> Result<Vec<NodeName>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT node FROM schema_peers ORDER BY node")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(NodeName::new(row?));
        }
        Ok(peers)
    }

    /// Write or delete records of a disc-copy table in one SQLite transaction.
    /// `None` deletes the key.
    pub async fn apply(&self, table: &str, changes: &[(Value, Option<Record>)]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for (key, record) in changes {
            let key_blob = bincode::serialize(key)?;
            match record {
                Some(record) => {
                    let blob = bincode::serialize(record)?;
                    tx.execute(
                        r#"
                        INSERT INTO records (table_name, record_key, record) VALUES (?1, ?2, ?3)
                        ON CONFLICT(table_name, record_key) DO UPDATE SET record = ?3
                        "#,
                        params![table, key_blob, blob],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM records WHERE table_name = ?1 AND record_key = ?2",
                        params![table, key_blob],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace every record of a disc-copy table in one SQLite transaction
    pub async fn replace_records(&self, table: &str, records: &[Record]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records WHERE table_name = ?1", params![table])?;
        for record in records {
            tx.execute(
                "INSERT INTO records (table_name, record_key, record) VALUES (?1, ?2, ?3)",
                params![
                    table,
                    bincode::serialize(&record.key)?,
                    bincode::serialize(record)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn clear_records(&self, table: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM records WHERE table_name = ?1", params![table])?;
        Ok(())
    }

    pub async fn load_records(&self, table: &str) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM records WHERE table_name = ?1")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, Vec<u8>>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(bincode::deserialize(&row?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CopyType, Shard};
    use tempfile::tempdir;

    fn disc_spec() -> TableSpec {
        TableSpec {
            shard: Shard::named("sh1"),
            copy_type: CopyType::Disc,
            config: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_tables_and_peers_persist() {
        let dir = tempdir().unwrap();

        {
            let store = DiskStore::open(dir.path()).unwrap();
            store.save_table("orders", &disc_spec()).await.unwrap();
            store.save_peer(&NodeName::from("b:4370")).await.unwrap();
            store.save_peer(&NodeName::from("c:4370")).await.unwrap();
            store.remove_peer(&NodeName::from("c:4370")).await.unwrap();
        }

        let store = DiskStore::open(dir.path()).unwrap();
        let tables = store.load_tables().await.unwrap();
        assert_eq!(tables, vec![("orders".to_string(), disc_spec())]);
        assert_eq!(store.load_peers().await.unwrap(), vec![NodeName::from("b:4370")]);
    }

    #[tokio::test]
    async fn test_record_changes() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        store
            .apply(
                "orders",
                &[
                    (Value::Int(1), Some(Record::new(1, "one"))),
                    (Value::Int(2), Some(Record::new(2, "two"))),
                ],
            )
            .await
            .unwrap();
        store.apply("orders", &[(Value::Int(1), None)]).await.unwrap();

        let records = store.load_records("orders").await.unwrap();
        assert_eq!(records, vec![Record::new(2, "two")]);

        store.clear_records("orders").await.unwrap();
        assert!(store.load_records("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy() {
        let dir = tempdir().unwrap();
        {
            DiskStore::open(dir.path()).unwrap();
        }
        assert!(DiskStore::exists(dir.path()));
        DiskStore::destroy(dir.path()).unwrap();
        assert!(!DiskStore::exists(dir.path()));
        // Idempotent
        DiskStore::destroy(dir.path()).unwrap();
    }
}
