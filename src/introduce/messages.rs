//! Introduce protocol messages.

use crate::didcomm::Thread;
use crate::didexchange::Invitation;
use serde::{Deserialize, Serialize};

pub const PROPOSAL_MSG_TYPE: &str = "https://didcomm.org/introduce/1.0/proposal";
pub const REQUEST_MSG_TYPE: &str = "https://didcomm.org/introduce/1.0/request";
pub const RESPONSE_MSG_TYPE: &str = "https://didcomm.org/introduce/1.0/response";
pub const ACK_MSG_TYPE: &str = "https://didcomm.org/introduce/1.0/ack";
pub const PROBLEM_REPORT_MSG_TYPE: &str = "https://didcomm.org/introduce/1.0/problem-report";

/// Describes the party someone is being introduced to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct To {
    pub name: String,
}

/// Introducer → introducee: "would you like to meet `to`?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<To>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Proposal {
    pub fn new(to: Option<To>, thread_id: &str) -> Self {
        Self {
            msg_type: PROPOSAL_MSG_TYPE.to_string(),
            id: None,
            to,
            thread: Some(Thread::with_id(thread_id)),
        }
    }
}

/// Introducee → introducer: "please introduce me to ..."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub please_introduce_to: Option<To>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Request {
    pub fn new(please_introduce_to: Option<To>) -> Self {
        Self {
            msg_type: REQUEST_MSG_TYPE.to_string(),
            id: None,
            please_introduce_to,
            thread: None,
        }
    }
}

/// Introducee → introducer: answer to a proposal.
///
/// `approve` is required: a response without it carries no approval signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation: Option<Invitation>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Response {
    pub fn new(approve: bool, invitation: Option<Invitation>, thread_id: &str) -> Self {
        Self {
            msg_type: RESPONSE_MSG_TYPE.to_string(),
            id: None,
            approve,
            invitation,
            thread: Some(Thread::with_id(thread_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Ack {
    pub fn new(thread_id: &str) -> Self {
        Self {
            msg_type: ACK_MSG_TYPE.to_string(),
            id: None,
            thread: Some(Thread::with_id(thread_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProblemReport {
    pub fn new(description: &str) -> Self {
        Self {
            msg_type: PROBLEM_REPORT_MSG_TYPE.to_string(),
            id: None,
            description: Some(description.to_string()),
        }
    }
}
