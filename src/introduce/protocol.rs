//! Introduce protocol hooks: record loading, candidate selection, decisions
//! and persistence.

use super::messages::{
    Response, ACK_MSG_TYPE, PROBLEM_REPORT_MSG_TYPE, PROPOSAL_MSG_TYPE, REQUEST_MSG_TYPE,
    RESPONSE_MSG_TYPE,
};
use super::metadata::{
    default_skip_proposal, IntroduceContext, IntroduceRecord, Recipient, SkipProposal,
};
use super::states::IntroduceState;
use crate::didcomm::DidCommMsg;
use crate::didexchange::{Invitation, INVITATION_MSG_TYPE};
use crate::protocol::{
    Decision, Properties, Protocol, ProtocolError, ProtocolResult, ProtocolState, StateMachine,
    Trigger,
};
use crate::storage::{get_json, put_json, StorageResult, Store, StoreProvider};
use async_trait::async_trait;
use std::sync::Arc;

pub const INTRODUCE_PROTOCOL: &str = "introduce";

/// Name of the store holding introduce threads.
pub const INTRODUCE_STORE_NAME: &str = "introduce";

/// Introduce protocol run by the shared engine.
pub type IntroduceService = StateMachine<Introduce>;

fn record_key(thread_id: &str) -> String {
    format!("introduce_{}", thread_id)
}

/// Options for an outbound message or an action continuation.
#[derive(Debug, Clone, Default)]
pub struct IntroduceOptions {
    /// Appended to the thread's recipients.
    pub recipients: Vec<Recipient>,
    /// Invitation this agent carries into the exchange.
    pub dependency: Option<Invitation>,
    /// Decline the proposal being decided on.
    pub disapprove: bool,
}

impl IntroduceOptions {
    pub fn with_recipients(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            ..Self::default()
        }
    }

    pub fn dependency(mut self, invitation: Invitation) -> Self {
        self.dependency = Some(invitation);
        self
    }

    pub fn disapproved() -> Self {
        Self {
            disapprove: true,
            ..Self::default()
        }
    }
}

/// Introduce protocol definition.
pub struct Introduce {
    store: Arc<dyn Store>,
    skip_proposal: SkipProposal,
}

impl Introduce {
    pub async fn new(provider: &dyn StoreProvider) -> StorageResult<Self> {
        Ok(Self {
            store: provider.open_store(INTRODUCE_STORE_NAME).await?,
            skip_proposal: default_skip_proposal(),
        })
    }

    /// Replace the skip-proposal predicate.
    pub fn with_skip_proposal(mut self, skip_proposal: SkipProposal) -> Self {
        self.skip_proposal = skip_proposal;
        self
    }

    /// Persisted record of `thread_id`.
    pub async fn record(&self, thread_id: &str) -> StorageResult<IntroduceRecord> {
        get_json(self.store.as_ref(), &record_key(thread_id)).await
    }

    async fn load_record(&self, thread_id: &str) -> StorageResult<IntroduceRecord> {
        match self.record(thread_id).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_not_found() => Ok(IntroduceRecord::new(thread_id)),
            Err(e) => Err(e),
        }
    }
}

/// Count the response and remember the first shared invitation.
fn observe_response(record: &mut IntroduceRecord, msg: &DidCommMsg, their_did: &str) {
    record.wait_count += 1;

    let Ok(response) = msg.decode::<Response>() else {
        return;
    };
    let Some(invitation) = response.invitation else {
        return;
    };
    if record.invitation.is_some() {
        return;
    }

    let responder = record
        .recipients
        .iter()
        .position(|r| !r.their_did.is_empty() && r.their_did == their_did)
        .unwrap_or_else(|| record.wait_count.saturating_sub(1) as usize);

    record.introducee_index = responder;
    record.invitation = Some(invitation);
}

/// Fill the first recipient from the inbound message; never overwrite.
fn hydrate_recipients(record: &mut IntroduceRecord, msg_type: &str, my_did: &str, their_did: &str) {
    match record.recipients.first_mut() {
        None if msg_type == REQUEST_MSG_TYPE => {
            record
                .recipients
                .push(Recipient::new(None, my_did, their_did));
        }
        Some(first) if msg_type == RESPONSE_MSG_TYPE => {
            if first.my_did.is_empty() {
                first.my_did = my_did.to_string();
            }
            if first.their_did.is_empty() {
                first.their_did = their_did.to_string();
            }
        }
        _ => {}
    }
}

/// Followup `delivering` produced for the response that led into it.
fn resume_delivery(ctx: &IntroduceContext) -> IntroduceState {
    if ctx.approve() == Some(false) {
        IntroduceState::Abandoning
    } else if ctx.is_skip_proposal() {
        IntroduceState::Done
    } else if ctx.record.invitation.is_some() {
        IntroduceState::Confirming
    } else {
        IntroduceState::Abandoning
    }
}

#[async_trait]
impl Protocol for Introduce {
    type State = IntroduceState;
    type Context = IntroduceContext;
    type Options = IntroduceOptions;

    fn name(&self) -> &'static str {
        INTRODUCE_PROTOCOL
    }

    /// Relayed invitations travel in a thread nested under the introduction.
    fn thread_id(&self, msg: &DidCommMsg) -> ProtocolResult<String> {
        if msg.msg_type() == INVITATION_MSG_TYPE {
            if let Some(pthid) = msg.parent_thread_id() {
                return Ok(pthid);
            }
        }
        Ok(msg.thread_id()?)
    }

    async fn load(
        &self,
        msg: &DidCommMsg,
        thread_id: &str,
        trigger: Trigger,
        my_did: &str,
        their_did: &str,
    ) -> ProtocolResult<(String, IntroduceContext)> {
        let mut record = self.load_record(thread_id).await?;

        let current = if record.state_name.is_empty() {
            IntroduceState::START.name().to_string()
        } else {
            record.state_name.clone()
        };

        // past arranging, both responses are already counted
        let counted = matches!(
            IntroduceState::from_name(&current),
            Some(IntroduceState::Done | IntroduceState::Delivering | IntroduceState::Confirming)
        );
        if trigger == Trigger::Inbound && !counted {
            hydrate_recipients(&mut record, msg.msg_type(), my_did, their_did);
            if msg.msg_type() == RESPONSE_MSG_TYPE {
                observe_response(&mut record, msg, their_did);
            }
        }

        let ctx = IntroduceContext::new(
            msg.clone(),
            my_did,
            their_did,
            record,
            self.skip_proposal.clone(),
        );
        Ok((current, ctx))
    }

    fn next_state(
        &self,
        ctx: &IntroduceContext,
        current: IntroduceState,
        trigger: Trigger,
    ) -> ProtocolResult<IntroduceState> {
        if trigger == Trigger::Inbound && current == IntroduceState::Done {
            return Ok(IntroduceState::Done);
        }

        let msg_type = ctx.msg.msg_type();
        if trigger == Trigger::Inbound && msg_type == RESPONSE_MSG_TYPE {
            match current {
                // re-driven after the invitation went out: resume at its followup
                IntroduceState::Delivering => return Ok(resume_delivery(ctx)),
                IntroduceState::Confirming => return Ok(IntroduceState::Done),
                _ => {}
            }
        }

        let next = match (trigger, msg_type) {
            (Trigger::Outbound, PROPOSAL_MSG_TYPE) => IntroduceState::Arranging,
            (Trigger::Outbound, REQUEST_MSG_TYPE) => IntroduceState::Requesting,
            (Trigger::Inbound, REQUEST_MSG_TYPE) => IntroduceState::Arranging,
            (Trigger::Inbound, PROPOSAL_MSG_TYPE) => IntroduceState::Deciding,
            (Trigger::Inbound, RESPONSE_MSG_TYPE) if ctx.record.wait_count <= 1 => {
                IntroduceState::Arranging
            }
            (Trigger::Inbound, RESPONSE_MSG_TYPE) => IntroduceState::Delivering,
            (Trigger::Inbound, PROBLEM_REPORT_MSG_TYPE) => IntroduceState::Abandoning,
            (Trigger::Inbound, ACK_MSG_TYPE) | (Trigger::Inbound, INVITATION_MSG_TYPE) => {
                IntroduceState::Done
            }
            _ => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unsupported {} message type '{}'",
                    trigger, msg_type
                )))
            }
        };
        Ok(next)
    }

    fn requires_action(&self, ctx: &IntroduceContext, trigger: Trigger, next: IntroduceState) -> bool {
        trigger == Trigger::Inbound
            && matches!(
                (ctx.msg.msg_type(), next),
                (REQUEST_MSG_TYPE, IntroduceState::Arranging)
                    | (PROPOSAL_MSG_TYPE, IntroduceState::Deciding)
            )
    }

    fn apply_options(&self, ctx: &mut IntroduceContext, options: IntroduceOptions) {
        ctx.record.recipients.extend(options.recipients);
        if options.dependency.is_some() {
            ctx.record.dependency = options.dependency;
        }
        ctx.disapprove |= options.disapprove;
    }

    fn apply_decision(
        &self,
        ctx: &mut IntroduceContext,
        next: IntroduceState,
        decision: Decision<IntroduceOptions>,
    ) -> IntroduceState {
        match decision {
            Decision::Continue(options) => {
                self.apply_options(ctx, options);
                next
            }
            Decision::Stop(reason) => {
                tracing::info!(
                    thread_id = %ctx.thread_id,
                    state = next.name(),
                    reason = %reason,
                    "Introduction stopped"
                );
                // a declined proposal is still answered
                if next == IntroduceState::Deciding {
                    ctx.disapprove = true;
                    IntroduceState::Deciding
                } else {
                    IntroduceState::Abandoning
                }
            }
        }
    }

    async fn persist(&self, ctx: &mut IntroduceContext, state: IntroduceState) -> ProtocolResult<()> {
        ctx.record.state_name = state.name().to_string();
        put_json(self.store.as_ref(), &record_key(&ctx.thread_id), &ctx.record).await?;
        Ok(())
    }

    fn properties(&self, ctx: &IntroduceContext) -> Properties {
        Properties::new()
            .with("myDID", ctx.my_did.clone())
            .with("theirDID", ctx.their_did.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::didcomm::Thread;
    use crate::introduce::messages::{Proposal, To};
    use crate::storage::MemStoreProvider;

    async fn introduce() -> Introduce {
        Introduce::new(&MemStoreProvider::new()).await.unwrap()
    }

    fn msg(value: serde_json::Value) -> DidCommMsg {
        DidCommMsg::new(&value).unwrap()
    }

    #[tokio::test]
    async fn test_request_synthesizes_requester() {
        let protocol = introduce().await;
        let request = msg(serde_json::json!({ "@type": REQUEST_MSG_TYPE, "@id": "t1" }));

        let (current, ctx) = protocol
            .load(&request, "t1", Trigger::Inbound, "did:me", "did:alice")
            .await
            .unwrap();

        assert_eq!(current, "start");
        assert_eq!(
            ctx.record.recipients,
            vec![Recipient::new(None, "did:me", "did:alice")]
        );
        assert_eq!(
            protocol.next_state(&ctx, IntroduceState::Start, Trigger::Inbound).unwrap(),
            IntroduceState::Arranging
        );
        assert!(protocol.requires_action(&ctx, Trigger::Inbound, IntroduceState::Arranging));
    }

    #[tokio::test]
    async fn test_response_counts_and_keeps_first_invitation() {
        let protocol = introduce().await;
        let mut ctx = IntroduceContext::new(
            DidCommMsg::default(),
            "did:me",
            "",
            IntroduceRecord::new("t1"),
            default_skip_proposal(),
        );
        ctx.record.recipients = vec![
            Recipient::new(Some(To { name: "Bob".into() }), "did:me", "did:alice"),
            Recipient::new(Some(To { name: "Alice".into() }), "did:me", "did:bob"),
        ];
        protocol.persist(&mut ctx, IntroduceState::Arranging).await.unwrap();

        let inv = Invitation::new("bob", "https://bob.example", vec![]);
        let response = msg(serde_json::json!({
            "@type": RESPONSE_MSG_TYPE,
            "approve": true,
            "invitation": inv,
            "~thread": { "thid": "t1" }
        }));

        let (current, ctx) = protocol
            .load(&response, "t1", Trigger::Inbound, "did:me", "did:bob")
            .await
            .unwrap();

        assert_eq!(current, "arranging");
        assert_eq!(ctx.record.wait_count, 1);
        assert_eq!(ctx.record.introducee_index, 1);
        assert_eq!(ctx.record.invitation, Some(inv));
        assert_eq!(
            protocol.next_state(&ctx, IntroduceState::Arranging, Trigger::Inbound).unwrap(),
            IntroduceState::Arranging
        );
    }

    #[tokio::test]
    async fn test_second_response_goes_to_delivering() {
        let protocol = introduce().await;
        let mut ctx = IntroduceContext::new(
            DidCommMsg::default(),
            "did:me",
            "",
            IntroduceRecord {
                wait_count: 1,
                ..IntroduceRecord::new("t1")
            },
            default_skip_proposal(),
        );
        protocol.persist(&mut ctx, IntroduceState::Arranging).await.unwrap();

        let response = msg(serde_json::json!({
            "@type": RESPONSE_MSG_TYPE,
            "approve": true,
            "~thread": { "thid": "t1" }
        }));
        let (_, ctx) = protocol
            .load(&response, "t1", Trigger::Inbound, "did:me", "did:bob")
            .await
            .unwrap();

        assert_eq!(ctx.record.wait_count, 2);
        assert_eq!(
            protocol.next_state(&ctx, IntroduceState::Arranging, Trigger::Inbound).unwrap(),
            IntroduceState::Delivering
        );
    }

    #[tokio::test]
    async fn test_redriven_response_resumes_after_delivering() {
        let protocol = introduce().await;
        let mut ctx = IntroduceContext::new(
            DidCommMsg::default(),
            "did:me",
            "",
            IntroduceRecord {
                wait_count: 2,
                invitation: Some(Invitation::new("bob", "https://bob.example", vec![])),
                ..IntroduceRecord::new("t1")
            },
            default_skip_proposal(),
        );
        protocol.persist(&mut ctx, IntroduceState::Delivering).await.unwrap();

        let response = msg(serde_json::json!({
            "@type": RESPONSE_MSG_TYPE,
            "approve": true,
            "~thread": { "thid": "t1" }
        }));
        let (current, ctx) = protocol
            .load(&response, "t1", Trigger::Inbound, "did:me", "did:bob")
            .await
            .unwrap();

        assert_eq!(current, "delivering");
        assert_eq!(ctx.record.wait_count, 2);
        assert_eq!(
            protocol.next_state(&ctx, IntroduceState::Delivering, Trigger::Inbound).unwrap(),
            IntroduceState::Confirming
        );
        assert_eq!(
            protocol.next_state(&ctx, IntroduceState::Confirming, Trigger::Inbound).unwrap(),
            IntroduceState::Done
        );
    }

    #[tokio::test]
    async fn test_candidate_selection() {
        let protocol = introduce().await;
        let ctx_for = |value: serde_json::Value| {
            IntroduceContext::new(
                msg(value),
                "did:me",
                "did:them",
                IntroduceRecord::new("t1"),
                default_skip_proposal(),
            )
        };

        let proposal = ctx_for(serde_json::to_value(Proposal::new(None, "t1")).unwrap());
        assert_eq!(
            protocol.next_state(&proposal, IntroduceState::Start, Trigger::Outbound).unwrap(),
            IntroduceState::Arranging
        );
        assert_eq!(
            protocol.next_state(&proposal, IntroduceState::Start, Trigger::Inbound).unwrap(),
            IntroduceState::Deciding
        );

        let request = ctx_for(serde_json::json!({ "@type": REQUEST_MSG_TYPE }));
        assert_eq!(
            protocol.next_state(&request, IntroduceState::Start, Trigger::Outbound).unwrap(),
            IntroduceState::Requesting
        );

        let report = ctx_for(serde_json::json!({ "@type": PROBLEM_REPORT_MSG_TYPE }));
        assert_eq!(
            protocol.next_state(&report, IntroduceState::Waiting, Trigger::Inbound).unwrap(),
            IntroduceState::Abandoning
        );

        let ack = ctx_for(serde_json::json!({ "@type": ACK_MSG_TYPE }));
        assert_eq!(
            protocol.next_state(&ack, IntroduceState::Waiting, Trigger::Inbound).unwrap(),
            IntroduceState::Done
        );
        assert_eq!(
            protocol.next_state(&report, IntroduceState::Done, Trigger::Inbound).unwrap(),
            IntroduceState::Done
        );

        let unknown = ctx_for(serde_json::json!({ "@type": "https://didcomm.org/other/1.0/x" }));
        assert!(matches!(
            protocol.next_state(&unknown, IntroduceState::Start, Trigger::Inbound),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_routes() {
        let protocol = introduce().await;
        let mut ctx = IntroduceContext::new(
            DidCommMsg::default(),
            "did:me",
            "did:them",
            IntroduceRecord::new("t1"),
            default_skip_proposal(),
        );

        let next = protocol.apply_decision(
            &mut ctx,
            IntroduceState::Deciding,
            Decision::Stop("no thanks".into()),
        );
        assert_eq!(next, IntroduceState::Deciding);
        assert!(ctx.disapprove);

        let next = protocol.apply_decision(
            &mut ctx,
            IntroduceState::Arranging,
            Decision::Stop("unknown peer".into()),
        );
        assert_eq!(next, IntroduceState::Abandoning);
    }

    #[tokio::test]
    async fn test_invitation_thread_is_parent() {
        let protocol = introduce().await;
        let mut invitation =
            DidCommMsg::new(&Invitation::new("bob", "https://bob.example", vec![])).unwrap();
        invitation.set_thread(Thread::with_parent("t1")).unwrap();

        assert_eq!(protocol.thread_id(&invitation).unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_done_thread_is_not_rehydrated() {
        let protocol = introduce().await;
        let mut ctx = IntroduceContext::new(
            DidCommMsg::default(),
            "did:me",
            "",
            IntroduceRecord {
                wait_count: 2,
                ..IntroduceRecord::new("t1")
            },
            default_skip_proposal(),
        );
        protocol.persist(&mut ctx, IntroduceState::Done).await.unwrap();

        let response = msg(serde_json::json!({
            "@type": RESPONSE_MSG_TYPE,
            "approve": true,
            "~thread": { "thid": "t1" }
        }));
        let (current, ctx) = protocol
            .load(&response, "t1", Trigger::Inbound, "did:me", "did:bob")
            .await
            .unwrap();

        assert_eq!(current, "done");
        assert_eq!(ctx.record.wait_count, 2);
    }
}
