//! Mock Messenger for Testing
//!
//! Records every outbound message so tests can assert on exactly what a
//! protocol run sent, and can inject transport failures.

use super::messenger::{Messenger, MessengerError, MessengerResult};
use super::DidCommMsg;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Mock messenger for testing
#[derive(Clone, Default)]
pub struct MockMessenger {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    sent_messages: Vec<SentMessage>,
    fail_with: Option<String>,
    fail_type: Option<String>,
    delay: Option<Duration>,
}

/// How a message left the messenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendKind {
    Send { my_did: String, their_did: String },
    ReplyTo { msg_id: String },
    ReplyToNested {
        thread_id: String,
        my_did: String,
        their_did: String,
    },
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub kind: SendKind,
    pub msg: DidCommMsg,
}

impl SentMessage {
    /// Peer DID the message was addressed to, when known.
    pub fn their_did(&self) -> Option<&str> {
        match &self.kind {
            SendKind::Send { their_did, .. } | SendKind::ReplyToNested { their_did, .. } => {
                Some(their_did)
            }
            SendKind::ReplyTo { .. } => None,
        }
    }
}

impl MockMessenger {
    /// Create new mock messenger
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get sent messages for assertions
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.lock().sent_messages.clone()
    }

    /// Sent messages with the given `@type`
    pub fn sent_of_type(&self, msg_type: &str) -> Vec<SentMessage> {
        self.lock()
            .sent_messages
            .iter()
            .filter(|m| m.msg.msg_type() == msg_type)
            .cloned()
            .collect()
    }

    /// Fail every subsequent operation with a transport error
    pub fn fail_with(&self, reason: &str) {
        self.lock().fail_with = Some(reason.to_string());
    }

    /// Fail only messages with the given `@type`
    pub fn fail_on(&self, msg_type: &str) {
        self.lock().fail_type = Some(msg_type.to_string());
    }

    /// Stop failing
    pub fn heal(&self) {
        let mut state = self.lock();
        state.fail_with = None;
        state.fail_type = None;
    }

    /// Delay every operation (used to widen race windows in tests)
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Clear all state
    pub fn clear(&self) {
        *self.lock() = MockState::default();
    }

    async fn record(&self, kind: SendKind, msg: DidCommMsg) -> MessengerResult<()> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(reason) = &state.fail_with {
            return Err(MessengerError::Transport(reason.clone()));
        }
        if state.fail_type.as_deref() == Some(msg.msg_type()) {
            return Err(MessengerError::Transport(format!(
                "{} rejected",
                msg.msg_type()
            )));
        }
        state.sent_messages.push(SentMessage { kind, msg });
        Ok(())
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, msg: DidCommMsg, my_did: &str, their_did: &str) -> MessengerResult<()> {
        let kind = SendKind::Send {
            my_did: my_did.to_string(),
            their_did: their_did.to_string(),
        };
        self.record(kind, msg).await
    }

    async fn reply_to(&self, msg_id: &str, msg: DidCommMsg) -> MessengerResult<()> {
        if msg_id.is_empty() {
            return Err(MessengerError::UnknownMessage(msg_id.to_string()));
        }
        let kind = SendKind::ReplyTo {
            msg_id: msg_id.to_string(),
        };
        self.record(kind, msg).await
    }

    async fn reply_to_nested(
        &self,
        thread_id: &str,
        msg: DidCommMsg,
        my_did: &str,
        their_did: &str,
    ) -> MessengerResult<()> {
        let kind = SendKind::ReplyToNested {
            thread_id: thread_id.to_string(),
            my_did: my_did.to_string(),
            their_did: their_did.to_string(),
        };
        self.record(kind, msg).await
    }
}
