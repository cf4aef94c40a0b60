//! SQLite store provider.
//!
//! All named stores share one table keyed by `(store, key)`, so a single
//! database file holds connection records, the DID store and in-flight
//! protocol threads. WAL journaling keeps readers unblocked by writers.

use super::{StorageError, StorageResult, Store, StoreProvider};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Pool size for file-backed databases.
const DEFAULT_POOL_SIZE: u32 = 4;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (store, key)
)";

/// Durable [`StoreProvider`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteStoreProvider {
    pool: SqlitePool,
}

impl SqliteStoreProvider {
    /// Open (creating if missing) a database file.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database (single connection, data lost on drop).
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StorageResult<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the underlying pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StoreProvider for SqliteStoreProvider {
    async fn open_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        if name.is_empty() {
            return Err(StorageError::Backend("store name cannot be empty".to_string()));
        }

        Ok(Arc::new(SqliteStore {
            pool: self.pool.clone(),
            name: name.to_string(),
        }))
    }
}

struct SqliteStore {
    pool: SqlitePool,
    name: String,
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO entries (store, key, value) VALUES (?, ?, ?)
             ON CONFLICT(store, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&self.name)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM entries WHERE store = ? AND key = ?")
                .bind(&self.name)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(value,)| value)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM entries WHERE store = ? AND key = ?")
            .bind(&self.name)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM entries
             WHERE store = ? AND substr(key, 1, length(?)) = ?
             ORDER BY key",
        )
        .bind(&self.name)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
