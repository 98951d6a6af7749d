//! SQLite cursor store
//!
//! One table, one row per key:
//!
//! ```sql
//! cursors(key TEXT PRIMARY KEY, value INTEGER NOT NULL, updated_at TEXT)
//! ```
//!
//! Statements run on the blocking pool so callers on the async runtime never
//! wait on file I/O.

use crate::domain::CursorRecord;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kappa_core::CursorStore;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// SQLite-backed [`CursorStore`]
#[derive(Clone)]
pub struct SqliteCursorStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteCursorStore {
    /// Open (or create) a store at `path`. Missing parent directories are
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        info!("Opened cursor store at {}", path.display());
        Ok(store)
    }

    /// In-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cursors (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                updated_at TEXT
            )",
            [],
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<u64>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM cursors WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            value
                .map(|v| u64::try_from(v).map_err(|_| StorageError::corrupt(&key, v)))
                .transpose()
        })
        .await
    }

    pub async fn put_value(&self, key: &str, value: u64) -> Result<()> {
        let key = key.to_string();
        let stored = i64::try_from(value).map_err(|_| StorageError::corrupt(&key, value))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cursors (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, stored, Utc::now()],
            )?;
            debug!(key = %key, value, "cursor stored");
            Ok(())
        })
        .await
    }

    pub async fn delete_value(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM cursors WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    /// Rows whose key starts with `prefix`, ordered by key.
    pub async fn list(&self, prefix: &str) -> Result<Vec<CursorRecord>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, updated_at FROM cursors
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<DateTime<Utc>>>(2)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (key, value, updated_at) = row?;
                let value = u64::try_from(value).map_err(|_| StorageError::corrupt(&key, value))?;
                records.push(CursorRecord {
                    key,
                    value,
                    updated_at,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM cursors", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

impl std::fmt::Debug for SqliteCursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCursorStore")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn get(&self, key: &str) -> kappa_core::Result<Option<u64>> {
        Ok(self.get_value(key).await?)
    }

    async fn put(&self, key: &str, value: u64) -> kappa_core::Result<()> {
        Ok(self.put_value(key, value).await?)
    }

    async fn delete(&self, key: &str) -> kappa_core::Result<()> {
        Ok(self.delete_value(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = SqliteCursorStore::open_in_memory().unwrap();
        assert_eq!(store.get_value("a").await.unwrap(), None);

        store.put_value("a", 3).await.unwrap();
        store.put_value("a", 9).await.unwrap();
        assert_eq!(store.get_value("a").await.unwrap(), Some(9));
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete_value("a").await.unwrap();
        assert_eq!(store.get_value("a").await.unwrap(), None);
        // deleting a missing key is not an error
        store.delete_value("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = SqliteCursorStore::open_in_memory().unwrap();
        store.put_value("idx!state!b", 2).await.unwrap();
        store.put_value("idx!state!a", 1).await.unwrap();
        store.put_value("idx!version!", 4).await.unwrap();
        store.put_value("other!state!a", 5).await.unwrap();

        let records = store.list("idx!").await.unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["idx!state!a", "idx!state!b", "idx!version!"]);
        assert!(records.iter().all(|r| r.updated_at.is_some()));
        assert!(records[2].is_version());

        assert_eq!(store.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_negative_row_is_corrupt() {
        let store = SqliteCursorStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO cursors (key, value) VALUES ('bad', -1)",
                [],
            )
            .unwrap();

        let err = store.get_value("bad").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
        assert!(store.list("b").await.is_err());
    }

    #[tokio::test]
    async fn test_value_beyond_i64_rejected() {
        let store = SqliteCursorStore::open_in_memory().unwrap();
        let err = store.put_value("huge", u64::MAX).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_store_errors_map_to_storage_kind() {
        let store = SqliteCursorStore::open_in_memory().unwrap();
        let err = CursorStore::put(&store, "huge", u64::MAX).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }
}
