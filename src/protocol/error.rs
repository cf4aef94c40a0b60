//! Engine error taxonomy.

use super::state::StateError;
use crate::connection::ConnectionError;
use crate::didcomm::{MessageError, MessengerError};
use crate::storage::StorageError;
use std::time::Duration;

/// Result type for protocol hooks (load / persist / next-state).
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by a protocol's hooks, before thread/state context is attached.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<MessageError> for ProtocolError {
    fn from(err: MessageError) -> Self {
        ProtocolError::InvalidMessage(err.to_string())
    }
}

/// Result type for transitions.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned to the caller of a transition.
///
/// Each carries the thread id and the state it failed in.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("[{thread_id}] unknown state '{state}'")]
    UnknownState { thread_id: String, state: String },

    #[error("[{thread_id}] illegal transition from '{from}' to '{to}'")]
    IllegalTransition {
        thread_id: String,
        from: String,
        to: String,
    },

    #[error("[{thread_id}] storage error in state '{state}': {source}")]
    Storage {
        thread_id: String,
        state: String,
        #[source]
        source: StorageError,
    },

    #[error("[{thread_id}] connection not found in state '{state}': {what}")]
    ConnectionNotFound {
        thread_id: String,
        state: String,
        what: String,
    },

    #[error("[{thread_id}] connection persistence error in state '{state}': {source}")]
    Connection {
        thread_id: String,
        state: String,
        #[source]
        source: ConnectionError,
    },

    #[error("[{thread_id}] send failed in state '{state}': {source}")]
    Send {
        thread_id: String,
        state: String,
        #[source]
        source: MessengerError,
    },

    #[error("[{thread_id}] no continuation for state '{state}' within {timeout:?}")]
    ContinuationTimeout {
        thread_id: String,
        state: String,
        timeout: Duration,
    },

    #[error("[{thread_id}] invalid message: {reason}")]
    InvalidMessage { thread_id: String, reason: String },

    #[error("[{thread_id}] state '{state}' failed: {source}")]
    Execution {
        thread_id: String,
        state: String,
        #[source]
        source: StateError,
    },
}

impl EngineError {
    /// Attach thread/state context to a protocol hook failure.
    pub fn from_protocol(thread_id: &str, state: &str, err: ProtocolError) -> Self {
        let thread_id = thread_id.to_string();
        let state = state.to_string();
        match err {
            ProtocolError::Storage(source) => EngineError::Storage {
                thread_id,
                state,
                source,
            },
            ProtocolError::Connection(ConnectionError::NotFound(what)) => {
                EngineError::ConnectionNotFound {
                    thread_id,
                    state,
                    what,
                }
            }
            ProtocolError::Connection(ConnectionError::Storage(source)) => EngineError::Storage {
                thread_id,
                state,
                source,
            },
            ProtocolError::Connection(source) => EngineError::Connection {
                thread_id,
                state,
                source,
            },
            ProtocolError::InvalidMessage(reason) => EngineError::InvalidMessage { thread_id, reason },
        }
    }

    /// Attach thread/state context to a state execution failure.
    pub fn from_state(thread_id: &str, state: &str, err: StateError) -> Self {
        let thread_id = thread_id.to_string();
        let state = state.to_string();
        match err {
            StateError::Send { source, .. } => EngineError::Send {
                thread_id,
                state,
                source,
            },
            source => EngineError::Execution {
                thread_id,
                state,
                source,
            },
        }
    }

    /// Thread the error belongs to.
    pub fn thread_id(&self) -> &str {
        match self {
            EngineError::UnknownState { thread_id, .. }
            | EngineError::IllegalTransition { thread_id, .. }
            | EngineError::Storage { thread_id, .. }
            | EngineError::ConnectionNotFound { thread_id, .. }
            | EngineError::Connection { thread_id, .. }
            | EngineError::Send { thread_id, .. }
            | EngineError::ContinuationTimeout { thread_id, .. }
            | EngineError::InvalidMessage { thread_id, .. }
            | EngineError::Execution { thread_id, .. } => thread_id,
        }
    }
}
