//! State and protocol traits.

use super::error::ProtocolResult;
use super::events::{Decision, Properties};
use crate::didcomm::{DidCommMsg, MessageError, Messenger, MessengerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What started a transition sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// A message received from a peer.
    Inbound,
    /// A message the local application asked to send.
    Outbound,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Inbound => f.write_str("inbound"),
            Trigger::Outbound => f.write_str("outbound"),
        }
    }
}

/// Result of executing a single state.
pub type StateResult<T> = Result<T, StateError>;

/// Errors from executing a single state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("{state}: {trigger} execution is not supported")]
    NotExecutable {
        state: &'static str,
        trigger: Trigger,
    },

    #[error("{action}: {source}")]
    Send {
        action: &'static str,
        #[source]
        source: MessengerError,
    },

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("message error: {0}")]
    Message(#[from] MessageError),
}

impl StateError {
    /// Wrap a messenger failure, naming what was being sent.
    pub fn send(action: &'static str) -> impl FnOnce(MessengerError) -> StateError {
        move |source| StateError::Send { action, source }
    }
}

/// One protocol state.
///
/// Implemented by a closed, `Copy` enum: states carry no per-instance data,
/// all mutable context lives in [`ProtocolState::Context`].
#[async_trait]
pub trait ProtocolState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Per-exchange context the states read and mutate.
    type Context: Send;

    /// The "nothing more to do" followup.
    const NOOP: Self;

    /// Entry state of a fresh thread.
    const START: Self;

    fn name(&self) -> &'static str;

    /// Registry lookup by persisted name.
    fn from_name(name: &str) -> Option<Self>;

    /// Transition legality from `self` to `next`.
    fn can_transition_to(&self, next: Self) -> bool;

    /// Terminal states accept redelivered messages without a transition.
    fn is_terminal(&self) -> bool;

    fn is_noop(&self) -> bool {
        *self == Self::NOOP
    }

    async fn execute_inbound(
        &self,
        messenger: &dyn Messenger,
        ctx: &mut Self::Context,
    ) -> StateResult<Self>;

    async fn execute_outbound(
        &self,
        messenger: &dyn Messenger,
        ctx: &mut Self::Context,
    ) -> StateResult<Self>;

    /// Execute for `trigger`, returning the followup state.
    async fn execute(
        &self,
        trigger: Trigger,
        messenger: &dyn Messenger,
        ctx: &mut Self::Context,
    ) -> StateResult<Self> {
        match trigger {
            Trigger::Inbound => self.execute_inbound(messenger, ctx).await,
            Trigger::Outbound => self.execute_outbound(messenger, ctx).await,
        }
    }
}

/// Access the engine needs into a protocol's context.
pub trait ProtocolContext: Send {
    /// The message being processed.
    fn message(&self) -> &DidCommMsg;
}

/// A protocol run by [`super::StateMachine`].
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    type State: ProtocolState<Context = Self::Context>;
    type Context: ProtocolContext;
    /// Options supplied with an outbound message or an action continuation.
    type Options: Default + Send + 'static;

    /// Protocol name used in events and logs.
    fn name(&self) -> &'static str;

    /// Thread id a message belongs to.
    fn thread_id(&self, msg: &DidCommMsg) -> ProtocolResult<String> {
        Ok(msg.thread_id()?)
    }

    /// Load the persisted state name and build the context for `msg`.
    ///
    /// Fresh threads report [`ProtocolState::START`]'s name.
    async fn load(
        &self,
        msg: &DidCommMsg,
        thread_id: &str,
        trigger: Trigger,
        my_did: &str,
        their_did: &str,
    ) -> ProtocolResult<(String, Self::Context)>;

    /// Candidate first state for `msg` given the current state.
    fn next_state(
        &self,
        ctx: &Self::Context,
        current: Self::State,
        trigger: Trigger,
    ) -> ProtocolResult<Self::State>;

    /// Whether entering `next` needs an application decision first.
    fn requires_action(&self, ctx: &Self::Context, trigger: Trigger, next: Self::State) -> bool;

    /// Merge caller-supplied options into the context.
    fn apply_options(&self, ctx: &mut Self::Context, options: Self::Options);

    /// Fold an action decision into the context and return the state to enter.
    fn apply_decision(
        &self,
        ctx: &mut Self::Context,
        next: Self::State,
        decision: Decision<Self::Options>,
    ) -> Self::State;

    /// Persist that the thread has entered `state`.
    async fn persist(&self, ctx: &mut Self::Context, state: Self::State) -> ProtocolResult<()>;

    /// Correlation properties attached to events.
    fn properties(&self, ctx: &Self::Context) -> Properties;
}
