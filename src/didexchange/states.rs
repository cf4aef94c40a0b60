//! Connection-exchange states.
//!
//! The same state set serves both roles; which branch runs depends on the
//! message being processed (the inviter sees Request/Ack, the invitee sees
//! Invitation/Response).

use super::messages::{
    Ack, Request, Response, INVITATION_MSG_TYPE, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE,
};
use super::protocol::ExchangeContext;
use crate::didcomm::{DidCommMsg, Messenger};
use crate::protocol::{ProtocolState, StateError, StateResult, Trigger};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    Noop,
    Start,
    Invited,
    Requested,
    Responded,
    Completed,
    Abandoned,
}

impl ExchangeState {
    pub const ALL: [ExchangeState; 7] = [
        ExchangeState::Noop,
        ExchangeState::Start,
        ExchangeState::Invited,
        ExchangeState::Requested,
        ExchangeState::Responded,
        ExchangeState::Completed,
        ExchangeState::Abandoned,
    ];

    fn unexpected(&self, ctx: &ExchangeContext) -> StateError {
        StateError::MissingData(format!(
            "{}: unexpected message type '{}'",
            self.name(),
            ctx.msg.msg_type()
        ))
    }
}

async fn requested_inbound(
    messenger: &dyn Messenger,
    ctx: &mut ExchangeContext,
) -> StateResult<ExchangeState> {
    match ctx.msg.msg_type() {
        // inviter: the request is accepted, answer it
        REQUEST_MSG_TYPE => Ok(ExchangeState::Responded),
        // invitee: ask to connect
        INVITATION_MSG_TYPE => {
            let request = Request::new(
                &ctx.record.thread_id,
                &ctx.record.invitation_id,
                &ctx.label,
                &ctx.my_did,
            );
            messenger
                .send(DidCommMsg::new(&request)?, &ctx.my_did, &ctx.their_did)
                .await
                .map_err(StateError::send("send request"))?;

            ctx.record.set_my_did(&ctx.my_did);
            Ok(ExchangeState::Noop)
        }
        _ => Err(ExchangeState::Requested.unexpected(ctx)),
    }
}

async fn responded_inbound(
    messenger: &dyn Messenger,
    ctx: &mut ExchangeContext,
) -> StateResult<ExchangeState> {
    match ctx.msg.msg_type() {
        REQUEST_MSG_TYPE => {
            let msg_id = ctx
                .msg
                .id()
                .ok_or_else(|| StateError::MissingData("request @id".to_string()))?
                .to_string();
            let response = Response::new(&ctx.thread_id, &ctx.my_did);
            messenger
                .reply_to(&msg_id, DidCommMsg::new(&response)?)
                .await
                .map_err(StateError::send("send response"))?;

            ctx.record.set_my_did(&ctx.my_did);
            Ok(ExchangeState::Noop)
        }
        RESPONSE_MSG_TYPE => {
            let response: Response = ctx.msg.decode()?;
            ctx.record.their_did = response.did;
            if !response.recipient_keys.is_empty() {
                ctx.record.recipient_keys = response.recipient_keys;
            }
            Ok(ExchangeState::Completed)
        }
        _ => Err(ExchangeState::Responded.unexpected(ctx)),
    }
}

async fn completed_inbound(
    messenger: &dyn Messenger,
    ctx: &mut ExchangeContext,
) -> StateResult<ExchangeState> {
    match ctx.msg.msg_type() {
        RESPONSE_MSG_TYPE => {
            let ack = DidCommMsg::new(&Ack::new(&ctx.thread_id))?;
            messenger
                .send(ack, &ctx.record.my_did, &ctx.record.their_did)
                .await
                .map_err(StateError::send("send ack"))?;
            Ok(ExchangeState::Noop)
        }
        // inviter: the ack completed the exchange
        _ => Ok(ExchangeState::Noop),
    }
}

#[async_trait]
impl ProtocolState for ExchangeState {
    type Context = ExchangeContext;

    const NOOP: Self = ExchangeState::Noop;
    const START: Self = ExchangeState::Start;

    fn name(&self) -> &'static str {
        match self {
            ExchangeState::Noop => "noop",
            ExchangeState::Start => "start",
            ExchangeState::Invited => "invited",
            ExchangeState::Requested => "requested",
            ExchangeState::Responded => "responded",
            ExchangeState::Completed => "completed",
            ExchangeState::Abandoned => "abandoned",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    fn can_transition_to(&self, next: Self) -> bool {
        use ExchangeState::*;

        match self {
            Start => matches!(next, Invited | Requested | Abandoned),
            Invited => matches!(next, Requested | Abandoned),
            Requested => matches!(next, Responded | Abandoned),
            Responded => matches!(next, Completed | Abandoned),
            Completed | Abandoned | Noop => false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Abandoned)
    }

    async fn execute_inbound(
        &self,
        messenger: &dyn Messenger,
        ctx: &mut ExchangeContext,
    ) -> StateResult<Self> {
        match self {
            ExchangeState::Invited => match ctx.msg.msg_type() {
                INVITATION_MSG_TYPE => Ok(ExchangeState::Requested),
                _ => Err(self.unexpected(ctx)),
            },
            ExchangeState::Requested => requested_inbound(messenger, ctx).await,
            ExchangeState::Responded => responded_inbound(messenger, ctx).await,
            ExchangeState::Completed => completed_inbound(messenger, ctx).await,
            ExchangeState::Abandoned => Ok(ExchangeState::Noop),
            ExchangeState::Noop | ExchangeState::Start => Err(StateError::NotExecutable {
                state: self.name(),
                trigger: Trigger::Inbound,
            }),
        }
    }

    async fn execute_outbound(
        &self,
        _messenger: &dyn Messenger,
        _ctx: &mut ExchangeContext,
    ) -> StateResult<Self> {
        Err(StateError::NotExecutable {
            state: self.name(),
            trigger: Trigger::Outbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExchangeState::*;

    #[test]
    fn test_transition_table() {
        let legal = [
            (Start, Invited),
            (Start, Requested),
            (Start, Abandoned),
            (Invited, Requested),
            (Invited, Abandoned),
            (Requested, Responded),
            (Requested, Abandoned),
            (Responded, Completed),
            (Responded, Abandoned),
        ];

        for from in ExchangeState::ALL {
            for to in ExchangeState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Abandoned.is_terminal());
        assert!(!Responded.is_terminal());
        assert!(Noop.is_noop());
    }

    #[test]
    fn test_registry_lookup() {
        for state in ExchangeState::ALL {
            assert_eq!(ExchangeState::from_name(state.name()), Some(state));
        }
        assert_eq!(ExchangeState::from_name("arranging"), None);
    }
}
