//! DID store and the resolver boundary.
//!
//! DID documents are only persisted through [`DidStore::save_did_by_resolving`];
//! nothing writes a DID entry without resolving it first.

use super::{ConnectionError, ConnectionResult};
use crate::storage::{get_json, put_json, Store, StoreProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Name of the store holding resolved DIDs.
pub const DID_STORE_NAME: &str = "didconnection";

const KEY_PREFIX: &str = "key_";

/// Resolved DID document material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub recipient_keys: Vec<String>,
    #[serde(default)]
    pub service_endpoint: String,
}

/// Stored DID entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidRecord {
    pub document: DidDocument,
    /// Keys the DID was resolved with; falls back to the document's keys.
    pub recipient_keys: Vec<String>,
}

/// Resolves DIDs to documents (the VDR boundary).
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<DidDocument, String>;
}

/// Resolver over a fixed set of documents, for tests and static setups.
#[derive(Clone, Default)]
pub struct StaticDidResolver {
    documents: Arc<Mutex<HashMap<String, DidDocument>>>,
}

impl StaticDidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `document` resolvable under its id.
    pub fn insert(&self, document: DidDocument) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document.id.clone(), document);
    }
}

#[async_trait]
impl DidResolver for StaticDidResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, String> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(did)
            .cloned()
            .ok_or_else(|| format!("DID not found: {}", did))
    }
}

/// Persists resolved DIDs and a recipient-key → DID index.
#[derive(Clone)]
pub struct DidStore {
    store: Arc<dyn Store>,
    resolver: Arc<dyn DidResolver>,
}

impl DidStore {
    pub async fn new(
        provider: &dyn StoreProvider,
        resolver: Arc<dyn DidResolver>,
    ) -> ConnectionResult<Self> {
        let store = provider.open_store(DID_STORE_NAME).await?;
        Ok(Self { store, resolver })
    }

    /// Resolve `did` and persist the document under it.
    ///
    /// When `recipient_keys` is empty the document's own keys are indexed.
    pub async fn save_did_by_resolving(
        &self,
        did: &str,
        recipient_keys: &[String],
    ) -> ConnectionResult<()> {
        if did.is_empty() {
            return Err(ConnectionError::Resolution {
                did: did.to_string(),
                reason: "empty DID".to_string(),
            });
        }

        let document = self
            .resolver
            .resolve(did)
            .await
            .map_err(|reason| ConnectionError::Resolution {
                did: did.to_string(),
                reason,
            })?;

        let keys = if recipient_keys.is_empty() {
            document.recipient_keys.clone()
        } else {
            recipient_keys.to_vec()
        };

        let record = DidRecord {
            document,
            recipient_keys: keys,
        };
        put_json(self.store.as_ref(), did, &record).await?;

        for key in &record.recipient_keys {
            self.store
                .put(&format!("{}{}", KEY_PREFIX, key), did.as_bytes())
                .await?;
        }

        tracing::debug!(did = %did, keys = record.recipient_keys.len(), "Saved resolved DID");
        Ok(())
    }

    pub async fn get_did_document(&self, did: &str) -> ConnectionResult<DidDocument> {
        let record: DidRecord = get_json(self.store.as_ref(), did)
            .await
            .map_err(|e| ConnectionError::from_lookup(did, e))?;
        Ok(record.document)
    }

    /// DID whose document was saved with `recipient_key`.
    pub async fn get_did_by_key(&self, recipient_key: &str) -> ConnectionResult<String> {
        let key = format!("{}{}", KEY_PREFIX, recipient_key);
        let bytes = self
            .store
            .get(&key)
            .await
            .map_err(|e| ConnectionError::from_lookup(recipient_key, e))?;

        String::from_utf8(bytes).map_err(|e| ConnectionError::InvalidRecord(e.to_string()))
    }
}
