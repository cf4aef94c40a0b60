//! Generic protocol state-machine engine.
//!
//! A protocol supplies a closed state enum ([`ProtocolState`]) and a
//! [`Protocol`] describing how to load per-thread context, pick the next
//! state for a message, and persist progress. [`StateMachine`] runs it:
//!
//! 1. Lock the thread id (one transition sequence per thread at a time)
//! 2. Load the persisted state and context
//! 3. Pick and validate the first transition
//! 4. Raise an action event and wait for a decision, if the step needs one
//! 5. Execute states until a followup is the no-op sentinel, persisting
//!    and publishing pre/post state events around each one

pub mod engine;
pub mod error;
pub mod events;
pub mod state;
pub mod threads;

pub use engine::{StateMachine, TransitionOutcome};
pub use error::{EngineError, EngineResult, ProtocolError, ProtocolResult};
pub use events::{
    auto_execute_action_events, ActionEvent, Decision, EventDispatcher, EventError, Properties,
    StateMsg, StateMsgKind, PROPERTY_CONNECTION_ID, PROPERTY_INVITATION_ID,
};
pub use state::{Protocol, ProtocolContext, ProtocolState, StateError, StateResult, Trigger};
pub use threads::{ThreadGuard, ThreadLocks};
