//! Connection store: recorder plus DID store.

use super::did::{DidResolver, DidStore};
use super::record::ConnectionRecord;
use super::recorder::ConnectionRecorder;
use super::ConnectionResult;
use crate::storage::StoreProvider;
use std::sync::Arc;

/// Connection and DID persistence used by the connection-exchange protocol.
#[derive(Clone)]
pub struct ConnectionStore {
    pub connection_recorder: ConnectionRecorder,
    pub did_store: DidStore,
}

impl ConnectionStore {
    pub async fn new(
        provider: &dyn StoreProvider,
        resolver: Arc<dyn DidResolver>,
    ) -> ConnectionResult<Self> {
        Ok(Self {
            connection_recorder: ConnectionRecorder::new(provider).await?,
            did_store: DidStore::new(provider, resolver).await?,
        })
    }

    /// Save `record`; a `completed` record also gets its peer DID resolved and stored.
    ///
    /// An own DID awaiting resolution (see [`ConnectionRecord::set_my_did`])
    /// is resolved first. Before `completed` a failure only leaves it pending;
    /// at `completed` it is returned. Resolution failures are returned after
    /// the record itself has been written. The record is not rolled back.
    pub async fn save_connection_record(&self, record: &mut ConnectionRecord) -> ConnectionResult<()> {
        let own = self.resolve_my_did(record).await;
        self.connection_recorder.save_connection_record(record).await?;
        own?;

        if record.is_completed() {
            self.resolve_their_did(record).await?;
        }

        Ok(())
    }

    /// Save a newly created `record` together with its thread index entry.
    ///
    /// A `my_did` already set on the new record is resolved as in
    /// [`ConnectionStore::save_connection_record`].
    pub async fn save_connection_record_with_mappings(
        &self,
        record: &mut ConnectionRecord,
    ) -> ConnectionResult<()> {
        if !record.my_did.is_empty() {
            record.my_did_pending = true;
        }
        let own = self.resolve_my_did(record).await;
        self.connection_recorder
            .save_connection_record_with_mappings(record)
            .await?;
        own?;

        if record.is_completed() {
            self.resolve_their_did(record).await?;
        }

        Ok(())
    }

    async fn resolve_my_did(&self, record: &mut ConnectionRecord) -> ConnectionResult<()> {
        if !record.my_did_pending || record.my_did.is_empty() {
            return Ok(());
        }

        match self.did_store.save_did_by_resolving(&record.my_did, &[]).await {
            Ok(()) => {
                record.my_did_pending = false;
                Ok(())
            }
            Err(e) if record.is_completed() => {
                tracing::error!(
                    connection_id = %record.connection_id,
                    my_did = %record.my_did,
                    error = %e,
                    "Completed connection without a resolvable own DID"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %record.connection_id,
                    my_did = %record.my_did,
                    state = %record.state,
                    error = %e,
                    "DID resolution deferred"
                );
                Ok(())
            }
        }
    }

    async fn resolve_their_did(&self, record: &ConnectionRecord) -> ConnectionResult<()> {
        self.did_store
            .save_did_by_resolving(&record.their_did, &record.recipient_keys)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.connection_id,
                    their_did = %record.their_did,
                    error = %e,
                    "Completed connection without a resolvable peer DID"
                );
                e
            })
    }
}
