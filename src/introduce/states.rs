//! Introduce protocol states.
//!
//! Introducer: `arranging` → `delivering` → `confirming` → `done`.
//! Introducee: `requesting` / `deciding` → `waiting` → `done`.
//! Either side may go through `abandoning`.
//!
//! Every execution performs its send last, so an error means nothing was sent.

use super::messages::{Ack, ProblemReport, Proposal, Response, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE};
use super::metadata::{IntroduceContext, Recipient, INITIAL_WAIT_COUNT};
use crate::didcomm::{DidCommMsg, Messenger};
use crate::protocol::{ProtocolState, StateError, StateResult, Trigger};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntroduceState {
    Noop,
    Start,
    Done,
    Arranging,
    Delivering,
    Confirming,
    Abandoning,
    Deciding,
    Waiting,
    Requesting,
}

impl IntroduceState {
    pub const ALL: [IntroduceState; 10] = [
        IntroduceState::Noop,
        IntroduceState::Start,
        IntroduceState::Done,
        IntroduceState::Arranging,
        IntroduceState::Delivering,
        IntroduceState::Confirming,
        IntroduceState::Abandoning,
        IntroduceState::Deciding,
        IntroduceState::Waiting,
        IntroduceState::Requesting,
    ];
}

/// Destination index for an invitation shared by introducee `idx`: the other one.
pub fn to_dest_idx(idx: usize) -> usize {
    if idx == 0 {
        1
    } else {
        0
    }
}

fn recipient_at(ctx: &IntroduceContext, idx: usize) -> StateResult<Recipient> {
    ctx.record
        .recipients
        .get(idx)
        .cloned()
        .ok_or_else(|| StateError::MissingData(format!("recipient {}", idx)))
}

/// Recipients for a problem report, back-filling the first one from the
/// inbound message (it may be unknown until a request arrives).
fn fill_recipients(mut recipients: Vec<Recipient>, ctx: &IntroduceContext) -> Vec<Recipient> {
    match recipients.first_mut() {
        None => recipients.push(Recipient::new(None, &ctx.my_did, &ctx.their_did)),
        Some(first) => {
            if first.my_did.is_empty() {
                first.my_did = ctx.my_did.clone();
            }
            if first.their_did.is_empty() {
                first.their_did = ctx.their_did.clone();
            }
        }
    }
    recipients
}

async fn arranging_inbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
) -> StateResult<IntroduceState> {
    if ctx.msg.msg_type() == RESPONSE_MSG_TYPE && ctx.is_skip_proposal() {
        return Ok(IntroduceState::Delivering);
    }

    if ctx.approve() == Some(false) {
        return Ok(IntroduceState::Abandoning);
    }

    let idx = if ctx.record.wait_count == INITIAL_WAIT_COUNT {
        0
    } else {
        1
    };
    let recipient = recipient_at(ctx, idx)?;
    let proposal = DidCommMsg::new(&Proposal::new(recipient.to.clone(), &ctx.thread_id))?;

    messenger
        .send(proposal, &recipient.my_did, &recipient.their_did)
        .await
        .map_err(StateError::send("send proposal"))?;

    Ok(IntroduceState::Noop)
}

async fn delivering_inbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
) -> StateResult<IntroduceState> {
    if ctx.approve() == Some(false) {
        return Ok(IntroduceState::Abandoning);
    }

    if ctx.is_skip_proposal() {
        let invitation = ctx
            .record
            .dependency
            .clone()
            .ok_or_else(|| StateError::MissingData("carried invitation".to_string()))?;
        let recipient = recipient_at(ctx, 0)?;

        messenger
            .reply_to_nested(
                &ctx.thread_id,
                DidCommMsg::new(&invitation)?,
                &recipient.my_did,
                &recipient.their_did,
            )
            .await
            .map_err(StateError::send("send invitation (skip)"))?;

        return Ok(IntroduceState::Done);
    }

    // nobody shared an invitation
    let Some(invitation) = ctx.record.invitation.clone() else {
        return Ok(IntroduceState::Abandoning);
    };

    let recipient = recipient_at(ctx, to_dest_idx(ctx.record.introducee_index))?;
    messenger
        .reply_to_nested(
            &ctx.thread_id,
            DidCommMsg::new(&invitation)?,
            &recipient.my_did,
            &recipient.their_did,
        )
        .await
        .map_err(StateError::send("send invitation"))?;

    Ok(IntroduceState::Confirming)
}

async fn confirming_inbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
) -> StateResult<IntroduceState> {
    let recipient = recipient_at(ctx, ctx.record.introducee_index)?;
    let ack = DidCommMsg::new(&Ack::new(&ctx.thread_id))?;

    messenger
        .send(ack, &recipient.my_did, &recipient.their_did)
        .await
        .map_err(StateError::send("send ack"))?;

    Ok(IntroduceState::Done)
}

async fn abandoning_inbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
) -> StateResult<IntroduceState> {
    let mut recipients = match ctx.msg.msg_type() {
        REQUEST_MSG_TYPE => fill_recipients(Vec::new(), ctx),
        RESPONSE_MSG_TYPE => fill_recipients(ctx.record.recipients.clone(), ctx),
        _ => Vec::new(),
    };

    if ctx.approve() == Some(false) {
        // first refusal: nothing was committed to the other introducee yet
        if ctx.record.wait_count == 1 {
            return Ok(IntroduceState::Done);
        }
        // second refusal: the refusing introducee already knows
        recipients.truncate(1);
    }

    for recipient in &recipients {
        let report = DidCommMsg::new(&ProblemReport::new("introduction abandoned"))?;
        messenger
            .reply_to_nested(
                &ctx.thread_id,
                report,
                &recipient.my_did,
                &recipient.their_did,
            )
            .await
            .map_err(StateError::send("send problem-report"))?;
    }

    Ok(IntroduceState::Done)
}

async fn deciding_inbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
) -> StateResult<IntroduceState> {
    let next = if ctx.disapprove {
        IntroduceState::Abandoning
    } else {
        IntroduceState::Waiting
    };

    let msg_id = ctx
        .msg
        .id()
        .ok_or_else(|| StateError::MissingData("proposal @id".to_string()))?
        .to_string();
    let response = DidCommMsg::new(&Response::new(
        !ctx.disapprove,
        ctx.record.dependency.clone(),
        &ctx.thread_id,
    ))?;

    messenger
        .reply_to(&msg_id, response)
        .await
        .map_err(StateError::send("send response"))?;

    Ok(next)
}

async fn send_outbound(
    messenger: &dyn Messenger,
    ctx: &mut IntroduceContext,
    action: &'static str,
) -> StateResult<IntroduceState> {
    messenger
        .send(ctx.msg.clone(), &ctx.my_did, &ctx.their_did)
        .await
        .map_err(StateError::send(action))?;
    Ok(IntroduceState::Noop)
}

#[async_trait]
impl ProtocolState for IntroduceState {
    type Context = IntroduceContext;

    const NOOP: Self = IntroduceState::Noop;
    const START: Self = IntroduceState::Start;

    fn name(&self) -> &'static str {
        match self {
            IntroduceState::Noop => "noop",
            IntroduceState::Start => "start",
            IntroduceState::Done => "done",
            IntroduceState::Arranging => "arranging",
            IntroduceState::Delivering => "delivering",
            IntroduceState::Confirming => "confirming",
            IntroduceState::Abandoning => "abandoning",
            IntroduceState::Deciding => "deciding",
            IntroduceState::Waiting => "waiting",
            IntroduceState::Requesting => "requesting",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use IntroduceState::*;

        match self {
            Start => matches!(next, Arranging | Deciding | Requesting | Abandoning),
            Arranging => matches!(next, Arranging | Delivering | Abandoning | Done),
            Delivering => matches!(next, Confirming | Done | Abandoning),
            Confirming => matches!(next, Done | Abandoning),
            Abandoning => matches!(next, Done),
            Deciding => matches!(next, Waiting | Done | Abandoning),
            Waiting => matches!(next, Done | Abandoning),
            Requesting => matches!(next, Deciding | Abandoning | Done),
            Done | Noop => false,
        }
    }

    fn is_terminal(&self) -> bool {
        *self == IntroduceState::Done
    }

    async fn execute_inbound(
        &self,
        messenger: &dyn Messenger,
        ctx: &mut IntroduceContext,
    ) -> StateResult<Self> {
        match self {
            IntroduceState::Done | IntroduceState::Waiting => Ok(IntroduceState::Noop),
            IntroduceState::Arranging => arranging_inbound(messenger, ctx).await,
            IntroduceState::Delivering => delivering_inbound(messenger, ctx).await,
            IntroduceState::Confirming => confirming_inbound(messenger, ctx).await,
            IntroduceState::Abandoning => abandoning_inbound(messenger, ctx).await,
            IntroduceState::Deciding => deciding_inbound(messenger, ctx).await,
            IntroduceState::Noop | IntroduceState::Start | IntroduceState::Requesting => {
                Err(StateError::NotExecutable {
                    state: self.name(),
                    trigger: Trigger::Inbound,
                })
            }
        }
    }

    async fn execute_outbound(
        &self,
        messenger: &dyn Messenger,
        ctx: &mut IntroduceContext,
    ) -> StateResult<Self> {
        match self {
            IntroduceState::Arranging => send_outbound(messenger, ctx, "send proposal").await,
            IntroduceState::Requesting => send_outbound(messenger, ctx, "send request").await,
            _ => Err(StateError::NotExecutable {
                state: self.name(),
                trigger: Trigger::Outbound,
            }),
        }
    }
}
