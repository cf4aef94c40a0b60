//! Connection-exchange protocol hooks.

use super::messages::{
    Invitation, Request, ACK_MSG_TYPE, INVITATION_MSG_TYPE, REQUEST_MSG_TYPE, RESPONSE_MSG_TYPE,
};
use super::states::ExchangeState;
use crate::connection::{
    ConnectionError, ConnectionRecord, ConnectionRole, ConnectionStore, DidResolver,
    ThreadNamespace,
};
use crate::didcomm::DidCommMsg;
use crate::protocol::{
    Decision, Properties, Protocol, ProtocolContext, ProtocolError, ProtocolResult,
    ProtocolState, StateMachine, Trigger, PROPERTY_CONNECTION_ID, PROPERTY_INVITATION_ID,
};
use crate::storage::{get_json, put_json, StorageResult, Store, StoreProvider};
use async_trait::async_trait;
use std::sync::Arc;

pub const DIDEXCHANGE_PROTOCOL: &str = "didexchange";

/// Name of the store holding invitations this agent created.
pub const DIDEXCHANGE_STORE_NAME: &str = "didexchange";

pub type ExchangeService = StateMachine<DidExchange>;

fn invitation_key(invitation_id: &str) -> String {
    format!("inv_{}", invitation_id)
}

/// Request thread this agent opened in answer to a received invitation.
fn accepted_invitation_key(invitation_id: &str) -> String {
    format!("my_inv_{}", invitation_id)
}

/// Options for accepting an invitation or a request.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// DID to use on this connection instead of the one the message arrived on.
    pub my_did: Option<String>,
    /// Label sent with a request.
    pub label: Option<String>,
}

impl ExchangeOptions {
    pub fn with_did(did: &str) -> Self {
        Self {
            my_did: Some(did.to_string()),
            label: None,
        }
    }
}

/// Context for one connection-exchange step.
pub struct ExchangeContext {
    pub msg: DidCommMsg,
    pub thread_id: String,
    pub my_did: String,
    pub their_did: String,
    pub label: String,
    pub record: ConnectionRecord,
    /// Whether the thread index entry already exists.
    pub mapped: bool,
}

impl ProtocolContext for ExchangeContext {
    fn message(&self) -> &DidCommMsg {
        &self.msg
    }
}

/// Connection-exchange protocol definition.
pub struct DidExchange {
    connections: ConnectionStore,
    invitations: Arc<dyn Store>,
    label: String,
}

impl DidExchange {
    pub async fn new(
        provider: &dyn StoreProvider,
        resolver: Arc<dyn DidResolver>,
    ) -> ProtocolResult<Self> {
        Ok(Self {
            connections: ConnectionStore::new(provider, resolver).await?,
            invitations: provider.open_store(DIDEXCHANGE_STORE_NAME).await?,
            label: String::new(),
        })
    }

    /// Label announced in requests this agent sends.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn connections(&self) -> &ConnectionStore {
        &self.connections
    }

    /// Create and remember an invitation to connect.
    pub async fn create_invitation(
        &self,
        service_endpoint: &str,
        recipient_keys: Vec<String>,
    ) -> StorageResult<Invitation> {
        let invitation = Invitation::new(&self.label, service_endpoint, recipient_keys);
        put_json(
            self.invitations.as_ref(),
            &invitation_key(&invitation.id),
            &invitation,
        )
        .await?;

        tracing::info!(invitation_id = %invitation.id, "Created invitation");
        Ok(invitation)
    }

    pub async fn invitation(&self, invitation_id: &str) -> StorageResult<Invitation> {
        get_json(self.invitations.as_ref(), &invitation_key(invitation_id)).await
    }

    async fn find(
        &self,
        namespace: ThreadNamespace,
        thread_id: &str,
    ) -> ProtocolResult<Option<ConnectionRecord>> {
        match self
            .connections
            .connection_recorder
            .get_connection_by_thread(namespace, thread_id)
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(ConnectionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fresh inviter-side record for a request answering one of our invitations.
    async fn inviter_record(&self, msg: &DidCommMsg, thread_id: &str) -> ProtocolResult<ConnectionRecord> {
        let request: Request = msg.decode()?;
        let invitation_id = msg.parent_thread_id().ok_or_else(|| {
            ProtocolError::InvalidMessage("request is not bound to an invitation".to_string())
        })?;

        match self.invitation(&invitation_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unknown invitation '{}'",
                    invitation_id
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let mut record =
            ConnectionRecord::new(thread_id, ConnectionRole::Inviter, ThreadNamespace::Their);
        record.parent_thread_id = invitation_id.clone();
        record.invitation_id = invitation_id;
        record.their_did = request.did;
        record.their_label = request.label;
        record.recipient_keys = request.recipient_keys;
        Ok(record)
    }

    /// Invitee-side record for `msg`: the one already opened for this
    /// invitation, or a fresh one whose request thread id is chosen here.
    async fn invitee_record(&self, msg: &DidCommMsg) -> ProtocolResult<(ConnectionRecord, bool)> {
        let invitation: Invitation = msg.decode()?;

        match get_json::<String>(
            self.invitations.as_ref(),
            &accepted_invitation_key(&invitation.id),
        )
        .await
        {
            Ok(request_id) => {
                if let Some(record) = self.find(ThreadNamespace::My, &request_id).await? {
                    return Ok((record, true));
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut record =
            ConnectionRecord::new(request_id, ConnectionRole::Invitee, ThreadNamespace::My);
        record.parent_thread_id = invitation.id.clone();
        record.invitation_id = invitation.id;
        record.their_label = invitation.label;
        record.recipient_keys = invitation.recipient_keys;
        Ok((record, false))
    }
}

#[async_trait]
impl Protocol for DidExchange {
    type State = ExchangeState;
    type Context = ExchangeContext;
    type Options = ExchangeOptions;

    fn name(&self) -> &'static str {
        DIDEXCHANGE_PROTOCOL
    }

    async fn load(
        &self,
        msg: &DidCommMsg,
        thread_id: &str,
        _trigger: Trigger,
        my_did: &str,
        their_did: &str,
    ) -> ProtocolResult<(String, ExchangeContext)> {
        let (record, mapped) = match msg.msg_type() {
            REQUEST_MSG_TYPE => match self.find(ThreadNamespace::Their, thread_id).await? {
                Some(record) => (record, true),
                None => (self.inviter_record(msg, thread_id).await?, false),
            },
            INVITATION_MSG_TYPE => self.invitee_record(msg).await?,
            RESPONSE_MSG_TYPE => {
                let record = self
                    .connections
                    .connection_recorder
                    .get_connection_by_thread(ThreadNamespace::My, thread_id)
                    .await?;
                (record, true)
            }
            ACK_MSG_TYPE => {
                let record = self
                    .connections
                    .connection_recorder
                    .get_connection_by_thread(ThreadNamespace::Their, thread_id)
                    .await?;
                (record, true)
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unsupported message type '{}'",
                    other
                )))
            }
        };

        let current = if record.state.is_empty() {
            ExchangeState::START.name().to_string()
        } else {
            record.state.clone()
        };

        let ctx = ExchangeContext {
            msg: msg.clone(),
            thread_id: thread_id.to_string(),
            my_did: my_did.to_string(),
            their_did: their_did.to_string(),
            label: self.label.clone(),
            record,
            mapped,
        };
        Ok((current, ctx))
    }

    fn next_state(
        &self,
        ctx: &ExchangeContext,
        current: ExchangeState,
        trigger: Trigger,
    ) -> ProtocolResult<ExchangeState> {
        if trigger == Trigger::Outbound {
            return Err(ProtocolError::InvalidMessage(
                "connection exchange is driven by inbound messages only".to_string(),
            ));
        }
        if current.is_terminal() {
            return Ok(current);
        }

        use ExchangeState::*;

        // A message re-driven after a failed send resumes at the followup
        // that did not complete; one the thread already answered maps to
        // the current state and is absorbed.
        let next = match (ctx.msg.msg_type(), current) {
            (INVITATION_MSG_TYPE, Start) => Invited,
            (INVITATION_MSG_TYPE, Invited) => Requested,
            (INVITATION_MSG_TYPE, _) => current,
            (REQUEST_MSG_TYPE, Start) => Requested,
            (REQUEST_MSG_TYPE, Requested) => Responded,
            (REQUEST_MSG_TYPE, _) => current,
            (RESPONSE_MSG_TYPE, Responded) => Completed,
            (RESPONSE_MSG_TYPE, _) => Responded,
            (ACK_MSG_TYPE, _) => Completed,
            (other, _) => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unsupported message type '{}'",
                    other
                )))
            }
        };
        Ok(next)
    }

    fn requires_action(&self, ctx: &ExchangeContext, trigger: Trigger, next: ExchangeState) -> bool {
        trigger == Trigger::Inbound
            && matches!(
                (ctx.msg.msg_type(), next),
                (INVITATION_MSG_TYPE, ExchangeState::Invited)
                    | (REQUEST_MSG_TYPE, ExchangeState::Requested)
            )
    }

    fn apply_options(&self, ctx: &mut ExchangeContext, options: ExchangeOptions) {
        if let Some(did) = options.my_did {
            ctx.my_did = did;
        }
        if let Some(label) = options.label {
            ctx.label = label;
        }
    }

    fn apply_decision(
        &self,
        ctx: &mut ExchangeContext,
        next: ExchangeState,
        decision: Decision<ExchangeOptions>,
    ) -> ExchangeState {
        match decision {
            Decision::Continue(options) => {
                self.apply_options(ctx, options);
                next
            }
            Decision::Stop(reason) => {
                tracing::info!(
                    thread_id = %ctx.thread_id,
                    connection_id = %ctx.record.connection_id,
                    reason = %reason,
                    "Connection exchange abandoned"
                );
                ExchangeState::Abandoned
            }
        }
    }

    async fn persist(&self, ctx: &mut ExchangeContext, state: ExchangeState) -> ProtocolResult<()> {
        ctx.record.state = state.name().to_string();
        ctx.record.touch();

        if ctx.mapped {
            self.connections.save_connection_record(&mut ctx.record).await?;
        } else {
            self.connections
                .save_connection_record_with_mappings(&mut ctx.record)
                .await?;
            if ctx.record.role == ConnectionRole::Invitee {
                put_json(
                    self.invitations.as_ref(),
                    &accepted_invitation_key(&ctx.record.invitation_id),
                    &ctx.record.thread_id,
                )
                .await?;
            }
            ctx.mapped = true;
        }
        Ok(())
    }

    fn properties(&self, ctx: &ExchangeContext) -> Properties {
        Properties::new()
            .with(PROPERTY_CONNECTION_ID, ctx.record.connection_id.clone())
            .with(PROPERTY_INVITATION_ID, ctx.record.invitation_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StaticDidResolver;
    use crate::storage::MemStoreProvider;

    async fn exchange() -> DidExchange {
        DidExchange::new(&MemStoreProvider::new(), Arc::new(StaticDidResolver::new()))
            .await
            .unwrap()
            .with_label("alice")
    }

    fn request_for(invitation_id: &str) -> DidCommMsg {
        DidCommMsg::new(&Request::new("req-1", invitation_id, "bob", "did:peer:bob")).unwrap()
    }

    #[tokio::test]
    async fn test_create_invitation_is_stored() {
        let protocol = exchange().await;
        let invitation = protocol
            .create_invitation("https://alice.example", vec!["alice-key".into()])
            .await
            .unwrap();

        assert_eq!(invitation.label, "alice");
        assert_eq!(protocol.invitation(&invitation.id).await.unwrap(), invitation);
    }

    #[tokio::test]
    async fn test_request_for_known_invitation_starts_record() {
        let protocol = exchange().await;
        let invitation = protocol.create_invitation("https://alice.example", vec![]).await.unwrap();

        let (current, ctx) = protocol
            .load(&request_for(&invitation.id), "req-1", Trigger::Inbound, "", "")
            .await
            .unwrap();

        assert_eq!(current, "start");
        assert!(!ctx.mapped);
        assert_eq!(ctx.record.role, ConnectionRole::Inviter);
        assert_eq!(ctx.record.namespace, ThreadNamespace::Their);
        assert_eq!(ctx.record.their_did, "did:peer:bob");
        assert_eq!(ctx.record.invitation_id, invitation.id);
        assert_eq!(
            protocol.next_state(&ctx, ExchangeState::Start, Trigger::Inbound).unwrap(),
            ExchangeState::Requested
        );
        assert!(protocol.requires_action(&ctx, Trigger::Inbound, ExchangeState::Requested));
    }

    #[tokio::test]
    async fn test_request_for_unknown_invitation_is_rejected() {
        let protocol = exchange().await;

        let result = protocol
            .load(&request_for("nope"), "req-1", Trigger::Inbound, "", "")
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_response_without_record_is_not_found() {
        let protocol = exchange().await;
        let response =
            DidCommMsg::new(&super::super::messages::Response::new("req-9", "did:peer:bob")).unwrap();

        let result = protocol
            .load(&response, "req-9", Trigger::Inbound, "", "")
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Connection(ConnectionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_invitation_starts_invitee_record() {
        let protocol = exchange().await;
        let invitation = Invitation::new("carol", "https://carol.example", vec!["carol-key".into()]);
        let msg = DidCommMsg::new(&invitation).unwrap();

        let (current, ctx) = protocol
            .load(&msg, &invitation.id, Trigger::Inbound, "did:peer:alice", "")
            .await
            .unwrap();

        assert_eq!(current, "start");
        assert_eq!(ctx.record.role, ConnectionRole::Invitee);
        assert_eq!(ctx.record.namespace, ThreadNamespace::My);
        assert_ne!(ctx.record.thread_id, invitation.id);
        assert_eq!(ctx.record.recipient_keys, vec!["carol-key".to_string()]);
        assert_eq!(
            protocol.next_state(&ctx, ExchangeState::Start, Trigger::Inbound).unwrap(),
            ExchangeState::Invited
        );
    }

    #[tokio::test]
    async fn test_invitation_reloads_opened_record() {
        let protocol = exchange().await;
        let invitation = Invitation::new("carol", "https://carol.example", vec![]);
        let msg = DidCommMsg::new(&invitation).unwrap();

        let (_, mut ctx) = protocol
            .load(&msg, &invitation.id, Trigger::Inbound, "did:peer:alice", "")
            .await
            .unwrap();
        protocol.persist(&mut ctx, ExchangeState::Invited).await.unwrap();
        let request_thread = ctx.record.thread_id.clone();

        let (current, ctx) = protocol
            .load(&msg, &invitation.id, Trigger::Inbound, "did:peer:alice", "")
            .await
            .unwrap();
        assert_eq!(current, "invited");
        assert!(ctx.mapped);
        assert_eq!(ctx.record.thread_id, request_thread);
    }

    #[tokio::test]
    async fn test_next_state_resumes_and_absorbs() {
        use ExchangeState::*;

        let protocol = exchange().await;
        let invitation = protocol.create_invitation("https://alice.example", vec![]).await.unwrap();
        let (_, ctx) = protocol
            .load(&request_for(&invitation.id), "req-1", Trigger::Inbound, "", "")
            .await
            .unwrap();

        let cases = [(Start, Requested), (Requested, Responded), (Responded, Responded)];
        for (current, expected) in cases {
            assert_eq!(
                protocol.next_state(&ctx, current, Trigger::Inbound).unwrap(),
                expected,
                "request in {:?}",
                current
            );
        }

        let invite = Invitation::new("carol", "https://carol.example", vec![]);
        let (_, ctx) = protocol
            .load(&DidCommMsg::new(&invite).unwrap(), &invite.id, Trigger::Inbound, "", "")
            .await
            .unwrap();
        let cases = [(Start, Invited), (Invited, Requested), (Requested, Requested), (Completed, Completed)];
        for (current, expected) in cases {
            assert_eq!(
                protocol.next_state(&ctx, current, Trigger::Inbound).unwrap(),
                expected,
                "invitation in {:?}",
                current
            );
        }
    }

    #[tokio::test]
    async fn test_outbound_is_rejected() {
        let protocol = exchange().await;
        let invitation = Invitation::new("carol", "https://carol.example", vec![]);
        let msg = DidCommMsg::new(&invitation).unwrap();
        let (_, ctx) = protocol
            .load(&msg, &invitation.id, Trigger::Outbound, "", "")
            .await
            .unwrap();

        assert!(protocol
            .next_state(&ctx, ExchangeState::Start, Trigger::Outbound)
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_abandons_and_options_override_did() {
        let protocol = exchange().await;
        let invitation = protocol.create_invitation("https://alice.example", vec![]).await.unwrap();
        let (_, mut ctx) = protocol
            .load(&request_for(&invitation.id), "req-1", Trigger::Inbound, "did:a", "")
            .await
            .unwrap();

        let next = protocol.apply_decision(
            &mut ctx,
            ExchangeState::Requested,
            Decision::Continue(ExchangeOptions::with_did("did:peer:alice")),
        );
        assert_eq!(next, ExchangeState::Requested);
        assert_eq!(ctx.my_did, "did:peer:alice");

        let next = protocol.apply_decision(
            &mut ctx,
            ExchangeState::Requested,
            Decision::Stop("not today".into()),
        );
        assert_eq!(next, ExchangeState::Abandoned);
    }

    #[tokio::test]
    async fn test_persist_maps_once() {
        let protocol = exchange().await;
        let invitation = protocol.create_invitation("https://alice.example", vec![]).await.unwrap();
        let (_, mut ctx) = protocol
            .load(&request_for(&invitation.id), "req-1", Trigger::Inbound, "", "")
            .await
            .unwrap();

        protocol.persist(&mut ctx, ExchangeState::Requested).await.unwrap();
        assert!(ctx.mapped);

        let (current, ctx) = protocol
            .load(&request_for(&invitation.id), "req-1", Trigger::Inbound, "", "")
            .await
            .unwrap();
        assert_eq!(current, "requested");
        assert!(ctx.mapped);

        let props = protocol.properties(&ctx);
        assert_eq!(props.invitation_id(), Some(invitation.id.as_str()));
    }
}
