//! Connection-exchange messages.

use crate::didcomm::Thread;
use serde::{Deserialize, Serialize};

pub const INVITATION_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/invitation";
pub const REQUEST_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/request";
pub const RESPONSE_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/response";
pub const ACK_MSG_TYPE: &str = "https://didcomm.org/didexchange/1.0/ack";

/// Out-of-band invitation to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint", default)]
    pub service_endpoint: String,
}

impl Invitation {
    pub fn new(label: &str, service_endpoint: &str, recipient_keys: Vec<String>) -> Self {
        Self {
            msg_type: INVITATION_MSG_TYPE.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            recipient_keys,
            service_endpoint: service_endpoint.to_string(),
        }
    }
}

/// Invitee → inviter, in a thread nested under the invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub did: String,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Request {
    /// Request opening thread `id` under invitation `invitation_id`.
    pub fn new(id: &str, invitation_id: &str, label: &str, did: &str) -> Self {
        Self {
            msg_type: REQUEST_MSG_TYPE.to_string(),
            id: id.to_string(),
            label: label.to_string(),
            did: did.to_string(),
            recipient_keys: Vec::new(),
            thread: Some(Thread {
                thid: Some(id.to_string()),
                pthid: Some(invitation_id.to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub did: String,
    #[serde(rename = "recipientKeys", default)]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Response {
    pub fn new(thread_id: &str, did: &str) -> Self {
        Self {
            msg_type: RESPONSE_MSG_TYPE.to_string(),
            id: None,
            did: did.to_string(),
            recipient_keys: Vec::new(),
            thread: Some(Thread::with_id(thread_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: String,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Ack {
    pub fn new(thread_id: &str) -> Self {
        Self {
            msg_type: ACK_MSG_TYPE.to_string(),
            id: None,
            status: "OK".to_string(),
            thread: Some(Thread::with_id(thread_id)),
        }
    }
}
