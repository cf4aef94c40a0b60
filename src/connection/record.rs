//! Connection record types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// State name at which a connection's peer DID must be resolvable.
pub const STATE_COMPLETED: &str = "completed";

/// Which side of the exchange this agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Inviter,
    Invitee,
}

/// Thread index namespace.
///
/// Threads we opened are indexed under `my`; threads the peer opened under `their`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadNamespace {
    My,
    Their,
}

impl ThreadNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            ThreadNamespace::My => "my",
            ThreadNamespace::Their => "their",
        }
    }

    /// Index key for `thread_id` in this namespace.
    pub fn thread_key(&self, thread_id: &str) -> String {
        format!("{}_thid_{}", self.prefix(), thread_id)
    }
}

impl fmt::Display for ThreadNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Durable description of one peer relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub thread_id: String,
    /// Invitation the exchange was started from.
    #[serde(default)]
    pub parent_thread_id: String,
    pub state: String,
    pub role: ConnectionRole,
    pub namespace: ThreadNamespace,
    #[serde(default)]
    pub my_did: String,
    /// `my_did` has not been resolved into the DID store yet.
    #[serde(default)]
    pub my_did_pending: bool,
    #[serde(default)]
    pub their_did: String,
    #[serde(default)]
    pub their_label: String,
    #[serde(default)]
    pub recipient_keys: Vec<String>,
    #[serde(default)]
    pub invitation_id: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ConnectionRecord {
    /// New record with a fresh connection id.
    pub fn new(
        thread_id: impl Into<String>,
        role: ConnectionRole,
        namespace: ThreadNamespace,
    ) -> Self {
        let now = unix_now();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            parent_thread_id: String::new(),
            state: String::new(),
            role,
            namespace,
            my_did: String::new(),
            my_did_pending: false,
            their_did: String::new(),
            their_label: String::new(),
            recipient_keys: Vec::new(),
            invitation_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == STATE_COMPLETED
    }

    /// Set our DID on this connection; it is resolved on the next save.
    pub fn set_my_did(&mut self, did: &str) {
        if self.my_did != did {
            self.my_did = did.to_string();
            self.my_did_pending = true;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
