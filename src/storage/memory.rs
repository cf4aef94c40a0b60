//! In-memory store provider.
//!
//! Stores opened under the same name share data for the lifetime of the
//! provider. Failure injection lets tests exercise storage error paths.

use super::{StorageError, StorageResult, Store, StoreProvider};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory [`StoreProvider`].
#[derive(Clone, Default)]
pub struct MemStoreProvider {
    stores: Arc<Mutex<HashMap<String, Arc<MemStore>>>>,
}

impl MemStoreProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle to a named store (created on first use).
    pub fn store(&self, name: &str) -> StorageResult<Arc<MemStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::Backend("store registry lock poisoned".to_string()))?;
        Ok(stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemStore::default()))
            .clone())
    }
}

#[async_trait]
impl StoreProvider for MemStoreProvider {
    async fn open_store(&self, name: &str) -> StorageResult<Arc<dyn Store>> {
        let store: Arc<dyn Store> = self.store(name)?;
        Ok(store)
    }
}

/// One in-memory key space.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, Vec<u8>>,
    fail_get: Option<String>,
    fail_put: Option<String>,
}

impl MemStore {
    fn state(&self) -> StorageResult<MutexGuard<'_, MemState>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("store lock poisoned".to_string()))
    }

    /// Make every subsequent `get`/`query` fail with `message`.
    pub fn fail_get(&self, message: &str) {
        if let Ok(mut state) = self.state() {
            state.fail_get = Some(message.to_string());
        }
    }

    /// Make every subsequent `put` fail with `message`.
    pub fn fail_put(&self, message: &str) {
        if let Ok(mut state) = self.state() {
            state.fail_put = Some(message.to_string());
        }
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        if let Ok(mut state) = self.state() {
            state.fail_get = None;
            state.fail_put = None;
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.state().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// True when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut state = self.state()?;
        if let Some(msg) = &state.fail_put {
            return Err(StorageError::Backend(msg.clone()));
        }
        state.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let state = self.state()?;
        if let Some(msg) = &state.fail_get {
            return Err(StorageError::Backend(msg.clone()));
        }
        state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut state = self.state()?;
        state.entries.remove(key);
        Ok(())
    }

    async fn query(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let state = self.state()?;
        if let Some(msg) = &state.fail_get {
            return Err(StorageError::Backend(msg.clone()));
        }
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let provider = MemStoreProvider::new();
        let store = provider.open_store("s").await.unwrap();

        store.put("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"1".to_vec());
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let provider = MemStoreProvider::new();
        let store = provider.open_store("s").await.unwrap();

        let result = store.get("missing").await;
        assert!(matches!(result, Err(StorageError::NotFound(k)) if k == "missing"));
    }

    #[tokio::test]
    async fn test_same_name_shares_data() {
        let provider = MemStoreProvider::new();
        let first = provider.open_store("shared").await.unwrap();
        let second = provider.open_store("shared").await.unwrap();
        let other = provider.open_store("other").await.unwrap();

        first.put("k", b"v").await.unwrap();
        assert_eq!(second.get("k").await.unwrap(), b"v".to_vec());
        assert!(other.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_query_prefix() {
        let provider = MemStoreProvider::new();
        let store = provider.open_store("s").await.unwrap();

        store.put("conn_1", b"1").await.unwrap();
        store.put("conn_2", b"2").await.unwrap();
        store.put("connstate_1_x", b"3").await.unwrap();
        store.put("my_thid_1", b"4").await.unwrap();

        let results = store.query("conn_").await.unwrap();
        let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["conn_1", "conn_2"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let provider = MemStoreProvider::new();
        let store = provider.open_store("s").await.unwrap();

        store.put("k", b"v").await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let provider = MemStoreProvider::new();
        let mem = provider.store("s").unwrap();

        mem.fail_put("disk full");
        let err = mem.put("k", b"v").await.unwrap_err();
        assert!(err.to_string().contains("disk full"));

        mem.heal();
        mem.put("k", b"v").await.unwrap();

        mem.fail_get("io error");
        assert!(mem.get("k").await.is_err());
        assert!(mem.query("").await.is_err());
        assert_eq!(mem.len(), 1);
    }
}
