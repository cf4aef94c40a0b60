//! Connection recorder: records, per-state snapshots and the thread index.

use super::record::{ConnectionRecord, ThreadNamespace};
use super::{ConnectionError, ConnectionResult};
use crate::storage::{decode_json, get_json, put_json, StorageError, Store, StoreProvider};
use std::sync::Arc;

/// Name of the store holding connection records.
pub const CONNECTION_STORE_NAME: &str = "connection";

const CONN_PREFIX: &str = "conn_";

fn connection_key(connection_id: &str) -> String {
    format!("{}{}", CONN_PREFIX, connection_id)
}

fn state_key(connection_id: &str, state: &str) -> String {
    format!("connstate_{}_{}", connection_id, state)
}

/// Reads and writes [`ConnectionRecord`]s.
#[derive(Clone)]
pub struct ConnectionRecorder {
    store: Arc<dyn Store>,
}

impl ConnectionRecorder {
    pub async fn new(provider: &dyn StoreProvider) -> ConnectionResult<Self> {
        let store = provider.open_store(CONNECTION_STORE_NAME).await?;
        Ok(Self { store })
    }

    /// Save the current record and its snapshot for `record.state`.
    pub async fn save_connection_record(&self, record: &ConnectionRecord) -> ConnectionResult<()> {
        if record.connection_id.is_empty() {
            return Err(ConnectionError::InvalidRecord(
                "connection id is empty".to_string(),
            ));
        }

        put_json(self.store.as_ref(), &connection_key(&record.connection_id), record).await?;

        if !record.state.is_empty() {
            put_json(
                self.store.as_ref(),
                &state_key(&record.connection_id, &record.state),
                record,
            )
            .await?;
        }

        Ok(())
    }

    /// Save the record and index its thread id under the record's namespace.
    pub async fn save_connection_record_with_mappings(
        &self,
        record: &ConnectionRecord,
    ) -> ConnectionResult<()> {
        if record.thread_id.is_empty() {
            return Err(ConnectionError::InvalidRecord(
                "thread id is empty".to_string(),
            ));
        }

        self.save_connection_record(record).await?;

        let key = record.namespace.thread_key(&record.thread_id);
        self.store
            .put(&key, record.connection_id.as_bytes())
            .await?;

        tracing::debug!(
            connection_id = %record.connection_id,
            thread_id = %record.thread_id,
            namespace = %record.namespace,
            "Indexed connection thread"
        );
        Ok(())
    }

    pub async fn get_connection(&self, connection_id: &str) -> ConnectionResult<ConnectionRecord> {
        get_json(self.store.as_ref(), &connection_key(connection_id))
            .await
            .map_err(|e| ConnectionError::from_lookup(connection_id, e))
    }

    /// The record as it was when it entered `state`.
    pub async fn get_connection_at_state(
        &self,
        connection_id: &str,
        state: &str,
    ) -> ConnectionResult<ConnectionRecord> {
        get_json(self.store.as_ref(), &state_key(connection_id, state))
            .await
            .map_err(|e| ConnectionError::from_lookup(connection_id, e))
    }

    pub async fn get_connection_id_by_thread(
        &self,
        namespace: ThreadNamespace,
        thread_id: &str,
    ) -> ConnectionResult<String> {
        let key = namespace.thread_key(thread_id);
        let bytes = self
            .store
            .get(&key)
            .await
            .map_err(|e| ConnectionError::from_lookup(&key, e))?;

        String::from_utf8(bytes).map_err(|e| {
            ConnectionError::Storage(StorageError::Serialization(format!("{}: {}", key, e)))
        })
    }

    /// Record for `thread_id`, via the thread index.
    pub async fn get_connection_by_thread(
        &self,
        namespace: ThreadNamespace,
        thread_id: &str,
    ) -> ConnectionResult<ConnectionRecord> {
        let connection_id = self.get_connection_id_by_thread(namespace, thread_id).await?;
        self.get_connection(&connection_id).await
    }

    /// All records currently in `state`.
    pub async fn query_by_state(&self, state: &str) -> ConnectionResult<Vec<ConnectionRecord>> {
        let records: Vec<_> = self
            .query_all_records()
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect();

        if records.is_empty() {
            return Err(ConnectionError::NotFound(format!("state {}", state)));
        }
        Ok(records)
    }

    pub async fn query_all(&self) -> ConnectionResult<Vec<ConnectionRecord>> {
        let records = self.query_all_records().await?;
        if records.is_empty() {
            return Err(ConnectionError::NotFound("any connection".to_string()));
        }
        Ok(records)
    }

    /// Drop the record's lookup and thread index entries.
    ///
    /// Per-state snapshots are kept as history.
    pub async fn remove_connection(&self, connection_id: &str) -> ConnectionResult<()> {
        let record = self.get_connection(connection_id).await?;

        self.store.delete(&connection_key(connection_id)).await?;
        if !record.thread_id.is_empty() {
            self.store
                .delete(&record.namespace.thread_key(&record.thread_id))
                .await?;
        }

        tracing::info!(connection_id = %connection_id, "Removed connection");
        Ok(())
    }

    async fn query_all_records(&self) -> ConnectionResult<Vec<ConnectionRecord>> {
        let rows = self.store.query(CONN_PREFIX).await?;
        rows.iter()
            .map(|(key, bytes)| decode_json(key, bytes).map_err(ConnectionError::from))
            .collect()
    }
}
