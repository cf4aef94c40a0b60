//! Connection and DID persistence.
//!
//! ## Layout
//!
//! Store `connection`:
//! - `conn_<connectionID>` → current [`ConnectionRecord`]
//! - `connstate_<connectionID>_<state>` → record as it was when it entered `state`
//! - `<my|their>_thid_<threadID>` → connection id
//!
//! Store `didconnection`:
//! - `<did>` → resolved document plus the recipient keys used to resolve it
//! - `key_<recipientKey>` → did
//!
//! [`ConnectionStore`] composes the two and enforces the rule that a
//! `completed` connection always has its peer DID persisted.

pub mod did;
pub mod record;
pub mod recorder;
pub mod store;

pub use did::{DidDocument, DidResolver, DidStore, StaticDidResolver};
pub use record::{ConnectionRecord, ConnectionRole, ThreadNamespace, STATE_COMPLETED};
pub use recorder::ConnectionRecorder;
pub use store::ConnectionStore;

use crate::storage::StorageError;

/// Result type for connection persistence.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A read path found nothing (distinct from a storage failure).
    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Invalid connection record: {0}")]
    InvalidRecord(String),

    #[error("Failed to resolve DID '{did}': {reason}")]
    Resolution { did: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConnectionError {
    /// Map a storage miss on `what` to [`ConnectionError::NotFound`].
    pub(crate) fn from_lookup(what: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ConnectionError::NotFound(what.to_string()),
            other => ConnectionError::Storage(other),
        }
    }
}
