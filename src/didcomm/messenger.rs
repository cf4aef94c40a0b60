//! Messenger trait.
//!
//! All three operations complete (or fail) before the engine continues, so a
//! state only reports success once its message has been handed off.

use super::DidCommMsg;
use async_trait::async_trait;

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;

/// Messenger errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessengerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown message to reply to: {0}")]
    UnknownMessage(String),

    #[error("Message encoding error: {0}")]
    Encoding(String),
}

/// Outbound message operations used by protocol states.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a new message from `my_did` to `their_did`.
    async fn send(&self, msg: DidCommMsg, my_did: &str, their_did: &str) -> MessengerResult<()>;

    /// Reply to a previously received message.
    async fn reply_to(&self, msg_id: &str, msg: DidCommMsg) -> MessengerResult<()>;

    /// Send `msg` in a new thread nested under `thread_id`.
    async fn reply_to_nested(
        &self,
        thread_id: &str,
        msg: DidCommMsg,
        my_did: &str,
        their_did: &str,
    ) -> MessengerResult<()>;
}
