//! Generic DIDComm message.
//!
//! Messages are kept as JSON objects so the engine can route on `@type` and
//! `~thread` without knowing every payload. Typed payloads are produced with
//! [`DidCommMsg::new`] and read back with [`DidCommMsg::decode`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

const TYPE_KEY: &str = "@type";
const ID_KEY: &str = "@id";
const THREAD_KEY: &str = "~thread";

/// Result type for message handling.
pub type MessageResult<T> = Result<T, MessageError>;

/// Message decoding and envelope errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message payload must be a JSON object")]
    NotAnObject,

    #[error("message has neither a thread id nor an @id")]
    MissingThreadId,
}

/// Thread decorator (`~thread`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

impl Thread {
    /// Decorator placing a message on thread `thid`.
    pub fn with_id(thid: impl Into<String>) -> Self {
        Self {
            thid: Some(thid.into()),
            pthid: None,
        }
    }

    /// Decorator placing a message in a thread nested under `pthid`.
    pub fn with_parent(pthid: impl Into<String>) -> Self {
        Self {
            thid: None,
            pthid: Some(pthid.into()),
        }
    }
}

/// A DIDComm message as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DidCommMsg(Map<String, Value>);

impl DidCommMsg {
    /// Build a message from a typed payload, assigning an `@id` if absent.
    pub fn new<T: Serialize>(payload: &T) -> MessageResult<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(mut map) => {
                let has_id = map.get(ID_KEY).and_then(Value::as_str).is_some();
                if !has_id {
                    map.insert(
                        ID_KEY.to_string(),
                        Value::String(uuid::Uuid::new_v4().to_string()),
                    );
                }
                Ok(Self(map))
            }
            _ => Err(MessageError::NotAnObject),
        }
    }

    /// Parse a message from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> MessageResult<Self> {
        match serde_json::from_slice(bytes)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(MessageError::NotAnObject),
        }
    }

    /// Message type URI (`@type`), empty when missing.
    pub fn msg_type(&self) -> &str {
        self.str_field(TYPE_KEY).unwrap_or_default()
    }

    /// Message id (`@id`).
    pub fn id(&self) -> Option<&str> {
        self.str_field(ID_KEY)
    }

    /// Thread decorator, if present and well formed.
    pub fn thread(&self) -> Option<Thread> {
        self.0
            .get(THREAD_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Thread id: `~thread.thid`, falling back to `@id` for thread openers.
    pub fn thread_id(&self) -> MessageResult<String> {
        if let Some(thid) = self.thread().and_then(|t| t.thid) {
            if !thid.is_empty() {
                return Ok(thid);
            }
        }

        self.id()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or(MessageError::MissingThreadId)
    }

    /// Parent thread id (`~thread.pthid`).
    pub fn parent_thread_id(&self) -> Option<String> {
        self.thread()
            .and_then(|t| t.pthid)
            .filter(|pthid| !pthid.is_empty())
    }

    /// Replace the thread decorator.
    pub fn set_thread(&mut self, thread: Thread) -> MessageResult<()> {
        self.0
            .insert(THREAD_KEY.to_string(), serde_json::to_value(thread)?);
        Ok(())
    }

    /// Decode the message into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> MessageResult<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// Raw field access.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }
}
