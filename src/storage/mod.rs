//! Key/value store provider used by every persistent component.
//!
//! ## Storage Model
//!
//! - A provider hands out named stores (`connection`, `didconnection`,
//!   `introduce`, `didexchange`)
//! - Each store is a flat key space with prefix queries
//! - Absent keys are reported as [`StorageError::NotFound`], never as empty values
//!
//! Backends:
//! - [`MemStoreProvider`]: in-process maps (tests, ephemeral agents)
//! - [`SqliteStoreProvider`]: durable single-file store (restart-safe)

pub mod memory;
pub mod sqlite;

pub use memory::{MemStore, MemStoreProvider};
pub use sqlite::SqliteStoreProvider;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True when the error only reports a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A single named key/value store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite `key`.
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Fetch `key`, or [`StorageError::NotFound`].
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn query(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;
}

/// Opens named stores backed by one physical backend.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Open (creating if needed) the store called `name`.
    async fn open_store(&self, name: &str) -> StorageResult<Arc<dyn Store>>;
}

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.put(key, &bytes).await
}

/// Load `key` and decode it from JSON.
pub async fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> StorageResult<T> {
    let bytes = store.get(key).await?;
    decode_json(key, &bytes)
}

/// Decode a stored JSON value, naming the key on failure.
pub fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StorageError::Serialization(format!("{}: {}", key, e)))
}
