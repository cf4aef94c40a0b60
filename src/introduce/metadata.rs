//! Per-thread introduce record and the context states run against.

use super::messages::{Response, To, RESPONSE_MSG_TYPE};
use crate::didcomm::DidCommMsg;
use crate::didexchange::Invitation;
use crate::protocol::ProtocolContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Wait count before any response has been received.
pub const INITIAL_WAIT_COUNT: u32 = 0;

/// A party taking part in an introduction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// The party this recipient is being introduced to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<To>,
    #[serde(default)]
    pub my_did: String,
    #[serde(default)]
    pub their_did: String,
}

impl Recipient {
    pub fn new(to: Option<To>, my_did: &str, their_did: &str) -> Self {
        Self {
            to,
            my_did: my_did.to_string(),
            their_did: their_did.to_string(),
        }
    }
}

/// Persisted progress of one introduce thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntroduceRecord {
    pub thread_id: String,
    /// Last executed state (empty for a fresh thread).
    #[serde(default)]
    pub state_name: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    /// Responses received so far, including the one being processed.
    #[serde(default)]
    pub wait_count: u32,
    /// Index of the introducee who shared `invitation`.
    #[serde(default)]
    pub introducee_index: usize,
    /// Invitation shared by an introducee in its response.
    #[serde(default)]
    pub invitation: Option<Invitation>,
    /// Invitation carried by this agent (introducer handing out a known
    /// invitation, or introducee answering with its own).
    #[serde(default)]
    pub dependency: Option<Invitation>,
}

impl IntroduceRecord {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Self::default()
        }
    }
}

/// Decides whether the introducer can skip the second proposal.
pub type SkipProposal = Arc<dyn Fn(&IntroduceContext) -> bool + Send + Sync>;

/// Skip when an approving response arrives and the introducer already
/// carries an invitation to hand out.
pub fn default_skip_proposal() -> SkipProposal {
    Arc::new(|ctx: &IntroduceContext| {
        ctx.record.dependency.is_some()
            && ctx.msg.msg_type() == RESPONSE_MSG_TYPE
            && ctx.approve() == Some(true)
    })
}

/// Mutable context for one message's transition sequence.
pub struct IntroduceContext {
    pub msg: DidCommMsg,
    pub thread_id: String,
    pub my_did: String,
    pub their_did: String,
    pub record: IntroduceRecord,
    /// Set when the local introducee declines a proposal.
    pub disapprove: bool,
    pub(crate) skip_proposal: SkipProposal,
}

impl IntroduceContext {
    pub fn new(
        msg: DidCommMsg,
        my_did: &str,
        their_did: &str,
        record: IntroduceRecord,
        skip_proposal: SkipProposal,
    ) -> Self {
        Self {
            thread_id: record.thread_id.clone(),
            msg,
            my_did: my_did.to_string(),
            their_did: their_did.to_string(),
            record,
            disapprove: false,
            skip_proposal,
        }
    }

    pub fn is_skip_proposal(&self) -> bool {
        (self.skip_proposal)(self)
    }

    /// `approve` of a Response message.
    ///
    /// `None` for other message types and for undecodable responses: no
    /// approval signal, which is not the same as a disapproval.
    pub fn approve(&self) -> Option<bool> {
        if self.msg.msg_type() != RESPONSE_MSG_TYPE {
            return None;
        }
        self.msg.decode::<Response>().ok().map(|r| r.approve)
    }
}

impl ProtocolContext for IntroduceContext {
    fn message(&self) -> &DidCommMsg {
        &self.msg
    }
}

impl fmt::Debug for IntroduceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntroduceContext")
            .field("thread_id", &self.thread_id)
            .field("msg_type", &self.msg.msg_type())
            .field("record", &self.record)
            .field("disapprove", &self.disapprove)
            .finish()
    }
}
