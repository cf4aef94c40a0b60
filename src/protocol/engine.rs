//! State machine driver shared by every protocol.

use super::error::{EngineError, EngineResult};
use super::events::{ActionEvent, Decision, EventDispatcher, EventError, StateMsg, StateMsgKind};
use super::state::{Protocol, ProtocolContext, ProtocolState, Trigger};
use super::threads::ThreadLocks;
use crate::config::EventsConfig;
use crate::didcomm::{DidCommMsg, Messenger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a transition sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub thread_id: String,
    /// Last executed (and persisted) state.
    pub state: &'static str,
}

/// Runs protocol `P` over messages, one sequence per thread at a time.
pub struct StateMachine<P: Protocol> {
    protocol: Arc<P>,
    messenger: Arc<dyn Messenger>,
    events: EventDispatcher<P::Options>,
    threads: ThreadLocks,
    action_timeout: Duration,
}

impl<P: Protocol> StateMachine<P> {
    pub fn new(protocol: P, messenger: Arc<dyn Messenger>, events: &EventsConfig) -> Self {
        Self {
            protocol: Arc::new(protocol),
            messenger,
            events: EventDispatcher::new(events.publish_timeout, events.state_queue_capacity),
            threads: ThreadLocks::new(),
            action_timeout: events.action_timeout,
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn register_action_event(
        &self,
        tx: mpsc::Sender<ActionEvent<P::Options>>,
    ) -> Result<(), EventError> {
        self.events.register_action_event(tx)
    }

    pub fn unregister_action_event(&self) {
        self.events.unregister_action_event()
    }

    pub fn register_msg_event(&self, tx: mpsc::Sender<StateMsg>) {
        self.events.register_msg_event(tx)
    }

    pub fn unregister_msg_event(&self, tx: &mpsc::Sender<StateMsg>) {
        self.events.unregister_msg_event(tx)
    }

    /// Process a message received from `their_did`.
    pub async fn handle_inbound(
        &self,
        msg: DidCommMsg,
        my_did: &str,
        their_did: &str,
    ) -> EngineResult<TransitionOutcome> {
        self.handle(msg, Trigger::Inbound, my_did, their_did, None)
            .await
    }

    /// Process a message the application wants sent to `their_did`.
    pub async fn handle_outbound(
        &self,
        msg: DidCommMsg,
        my_did: &str,
        their_did: &str,
        options: P::Options,
    ) -> EngineResult<TransitionOutcome> {
        self.handle(msg, Trigger::Outbound, my_did, their_did, Some(options))
            .await
    }

    async fn handle(
        &self,
        msg: DidCommMsg,
        trigger: Trigger,
        my_did: &str,
        their_did: &str,
        options: Option<P::Options>,
    ) -> EngineResult<TransitionOutcome> {
        let thread_id = self.protocol.thread_id(&msg).map_err(|e| {
            EngineError::from_protocol(msg.id().unwrap_or_default(), "start", e)
        })?;

        let _guard = self.threads.lock(&thread_id).await;

        let (current_name, mut ctx) = self
            .protocol
            .load(&msg, &thread_id, trigger, my_did, their_did)
            .await
            .map_err(|e| EngineError::from_protocol(&thread_id, "start", e))?;

        let current = self.lookup(&thread_id, &current_name)?;
        let mut next = self
            .protocol
            .next_state(&ctx, current, trigger)
            .map_err(|e| EngineError::from_protocol(&thread_id, current.name(), e))?;

        // the thread already moved past this message
        if next == current && !current.can_transition_to(next) {
            tracing::debug!(
                protocol = self.protocol.name(),
                thread_id = %thread_id,
                state = current.name(),
                msg_type = msg.msg_type(),
                "Absorbed redelivered message"
            );
            return Ok(TransitionOutcome {
                thread_id,
                state: current.name(),
            });
        }
        self.check_transition(&thread_id, current, next)?;

        if let Some(options) = options {
            self.protocol.apply_options(&mut ctx, options);
        }

        if trigger == Trigger::Inbound && self.protocol.requires_action(&ctx, trigger, next) {
            let decision = self.await_decision(&thread_id, next, &ctx).await?;
            next = self.protocol.apply_decision(&mut ctx, next, decision);
        }

        let state = self
            .transition(&thread_id, current.name(), next, trigger, &mut ctx)
            .await?;

        Ok(TransitionOutcome {
            thread_id,
            state: state.name(),
        })
    }

    /// Enter `next` from the state named `current_name`, then run followups.
    ///
    /// Legality is only checked for the first step. Every executed state is
    /// persisted before its followup runs, so a failure leaves earlier steps
    /// committed.
    pub async fn transition(
        &self,
        thread_id: &str,
        current_name: &str,
        next: P::State,
        trigger: Trigger,
        ctx: &mut P::Context,
    ) -> EngineResult<P::State> {
        let current = self.lookup(thread_id, current_name)?;
        self.check_transition(thread_id, current, next)?;

        tracing::debug!(
            protocol = self.protocol.name(),
            thread_id = %thread_id,
            from = current.name(),
            to = next.name(),
            %trigger,
            "Starting transition"
        );

        let mut state = next;
        loop {
            self.publish(thread_id, StateMsgKind::PreState, state, ctx);

            let followup = state
                .execute(trigger, self.messenger.as_ref(), ctx)
                .await
                .map_err(|e| {
                    tracing::warn!(
                        protocol = self.protocol.name(),
                        thread_id = %thread_id,
                        state = state.name(),
                        error = %e,
                        "State execution failed"
                    );
                    EngineError::from_state(thread_id, state.name(), e)
                })?;

            self.protocol.persist(ctx, state).await.map_err(|e| {
                tracing::error!(
                    protocol = self.protocol.name(),
                    thread_id = %thread_id,
                    state = state.name(),
                    error = %e,
                    "Failed to persist state"
                );
                EngineError::from_protocol(thread_id, state.name(), e)
            })?;

            tracing::debug!(
                protocol = self.protocol.name(),
                thread_id = %thread_id,
                state = state.name(),
                followup = followup.name(),
                "Executed state"
            );

            self.publish(thread_id, StateMsgKind::PostState, state, ctx);

            if followup.is_noop() {
                return Ok(state);
            }
            state = followup;
        }
    }

    fn lookup(&self, thread_id: &str, name: &str) -> EngineResult<P::State> {
        P::State::from_name(name).ok_or_else(|| EngineError::UnknownState {
            thread_id: thread_id.to_string(),
            state: name.to_string(),
        })
    }

    fn check_transition(
        &self,
        thread_id: &str,
        current: P::State,
        next: P::State,
    ) -> EngineResult<()> {
        // a finished thread absorbs redelivered messages
        let redelivery = current.is_terminal() && current == next;
        if redelivery || current.can_transition_to(next) {
            return Ok(());
        }

        Err(EngineError::IllegalTransition {
            thread_id: thread_id.to_string(),
            from: current.name().to_string(),
            to: next.name().to_string(),
        })
    }

    async fn await_decision(
        &self,
        thread_id: &str,
        next: P::State,
        ctx: &P::Context,
    ) -> EngineResult<Decision<P::Options>> {
        let Some(tx) = self.events.action_sender() else {
            tracing::debug!(
                protocol = self.protocol.name(),
                thread_id = %thread_id,
                state = next.name(),
                "No action handler registered, continuing"
            );
            return Ok(Decision::Continue(P::Options::default()));
        };

        let (event, decision) = ActionEvent::new(
            self.protocol.name(),
            thread_id.to_string(),
            next.name(),
            ctx.message().clone(),
            self.protocol.properties(ctx),
        );

        tracing::info!(
            protocol = self.protocol.name(),
            thread_id = %thread_id,
            state = next.name(),
            "Raised action event"
        );

        match tokio::time::timeout(self.action_timeout, tx.send(event)).await {
            Err(_) => return Err(self.continuation_timeout(thread_id, next)),
            Ok(Err(_)) => {
                tracing::warn!(
                    protocol = self.protocol.name(),
                    thread_id = %thread_id,
                    "Action handler went away, continuing"
                );
                self.events.unregister_action_event();
                return Ok(Decision::Continue(P::Options::default()));
            }
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout(self.action_timeout, decision).await {
            Err(_) => Err(self.continuation_timeout(thread_id, next)),
            Ok(Err(_)) => {
                tracing::info!(
                    protocol = self.protocol.name(),
                    thread_id = %thread_id,
                    state = next.name(),
                    "Action event dropped without a decision, stopping"
                );
                Ok(Decision::Stop("action event dropped".to_string()))
            }
            Ok(Ok(decision)) => {
                tracing::info!(
                    protocol = self.protocol.name(),
                    thread_id = %thread_id,
                    state = next.name(),
                    continued = matches!(decision, Decision::Continue(_)),
                    "Action event answered"
                );
                Ok(decision)
            }
        }
    }

    fn continuation_timeout(&self, thread_id: &str, next: P::State) -> EngineError {
        tracing::warn!(
            protocol = self.protocol.name(),
            thread_id = %thread_id,
            state = next.name(),
            timeout = ?self.action_timeout,
            "Action event timed out"
        );
        EngineError::ContinuationTimeout {
            thread_id: thread_id.to_string(),
            state: next.name().to_string(),
            timeout: self.action_timeout,
        }
    }

    fn publish(&self, thread_id: &str, kind: StateMsgKind, state: P::State, ctx: &P::Context) {
        self.events.publish(StateMsg {
            protocol: self.protocol.name(),
            thread_id: thread_id.to_string(),
            kind,
            state_id: state.name(),
            message: ctx.message().clone(),
            properties: self.protocol.properties(ctx),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::didcomm::{MockMessenger, Thread};
    use crate::protocol::{Properties, ProtocolError, ProtocolResult, StateError, StateResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const PING: &str = "test/ping";
    const FINISH: &str = "test/finish";

    /// Ping → pinging → ponging, or straight to finished.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toy {
        Noop,
        Start,
        Pinging,
        Ponging,
        Finished,
    }

    struct ToyContext {
        msg: DidCommMsg,
        their_did: String,
    }

    impl ProtocolContext for ToyContext {
        fn message(&self) -> &DidCommMsg {
            &self.msg
        }
    }

    #[async_trait]
    impl ProtocolState for Toy {
        type Context = ToyContext;

        const NOOP: Self = Toy::Noop;
        const START: Self = Toy::Start;

        fn name(&self) -> &'static str {
            match self {
                Toy::Noop => "noop",
                Toy::Start => "start",
                Toy::Pinging => "pinging",
                Toy::Ponging => "ponging",
                Toy::Finished => "finished",
            }
        }

        fn from_name(name: &str) -> Option<Self> {
            [Toy::Noop, Toy::Start, Toy::Pinging, Toy::Ponging, Toy::Finished]
                .into_iter()
                .find(|s| s.name() == name)
        }

        fn can_transition_to(&self, next: Self) -> bool {
            matches!(
                (self, next),
                (Toy::Start, Toy::Pinging)
                    | (Toy::Start, Toy::Finished)
                    | (Toy::Pinging, Toy::Ponging)
                    | (Toy::Ponging, Toy::Finished)
            )
        }

        fn is_terminal(&self) -> bool {
            *self == Toy::Finished
        }

        async fn execute_inbound(
            &self,
            messenger: &dyn Messenger,
            ctx: &mut ToyContext,
        ) -> StateResult<Self> {
            match self {
                Toy::Pinging => Ok(Toy::Ponging),
                Toy::Ponging => {
                    let pong = DidCommMsg::new(&serde_json::json!({ "@type": "test/pong" }))?;
                    messenger
                        .send(pong, "did:me", &ctx.their_did)
                        .await
                        .map_err(StateError::send("send pong"))?;
                    Ok(Toy::Noop)
                }
                Toy::Finished => Ok(Toy::Noop),
                Toy::Noop | Toy::Start => Err(StateError::NotExecutable {
                    state: self.name(),
                    trigger: Trigger::Inbound,
                }),
            }
        }

        async fn execute_outbound(
            &self,
            _messenger: &dyn Messenger,
            _ctx: &mut ToyContext,
        ) -> StateResult<Self> {
            Err(StateError::NotExecutable {
                state: self.name(),
                trigger: Trigger::Outbound,
            })
        }
    }

    /// Keeps every persisted state name per thread.
    #[derive(Default)]
    struct ToyProtocol {
        persisted: Mutex<HashMap<String, Vec<&'static str>>>,
        preset: Mutex<HashMap<String, String>>,
    }

    impl ToyProtocol {
        fn history(&self, thread_id: &str) -> Vec<&'static str> {
            self.persisted
                .lock()
                .unwrap()
                .get(thread_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Protocol for ToyProtocol {
        type State = Toy;
        type Context = ToyContext;
        type Options = ();

        fn name(&self) -> &'static str {
            "toy"
        }

        async fn load(
            &self,
            msg: &DidCommMsg,
            thread_id: &str,
            _trigger: Trigger,
            _my_did: &str,
            their_did: &str,
        ) -> ProtocolResult<(String, ToyContext)> {
            let preset = self.preset.lock().unwrap().get(thread_id).cloned();
            let current = preset
                .or_else(|| self.history(thread_id).last().map(|s| s.to_string()))
                .unwrap_or_else(|| "start".to_string());

            let ctx = ToyContext {
                msg: msg.clone(),
                their_did: their_did.to_string(),
            };
            Ok((current, ctx))
        }

        fn next_state(&self, ctx: &ToyContext, current: Toy, _trigger: Trigger) -> ProtocolResult<Toy> {
            match ctx.msg.msg_type() {
                _ if current.is_terminal() => Ok(current),
                PING => Ok(Toy::Pinging),
                FINISH => Ok(Toy::Finished),
                other => Err(ProtocolError::InvalidMessage(other.to_string())),
            }
        }

        fn requires_action(&self, _ctx: &ToyContext, _trigger: Trigger, next: Toy) -> bool {
            next == Toy::Pinging
        }

        fn apply_options(&self, _ctx: &mut ToyContext, _options: ()) {}

        fn apply_decision(&self, _ctx: &mut ToyContext, next: Toy, decision: Decision<()>) -> Toy {
            match decision {
                Decision::Continue(()) => next,
                Decision::Stop(_) => Toy::Finished,
            }
        }

        async fn persist(&self, ctx: &mut ToyContext, state: Toy) -> ProtocolResult<()> {
            let thread_id = ctx.msg.thread_id()?;
            self.persisted
                .lock()
                .unwrap()
                .entry(thread_id)
                .or_default()
                .push(state.name());
            Ok(())
        }

        fn properties(&self, _ctx: &ToyContext) -> Properties {
            Properties::new()
        }
    }

    fn events_config(action_timeout: Duration) -> EventsConfig {
        EventsConfig {
            action_timeout,
            publish_timeout: Duration::from_millis(50),
            ..EventsConfig::default()
        }
    }

    fn machine(messenger: &MockMessenger) -> StateMachine<ToyProtocol> {
        StateMachine::new(
            ToyProtocol::default(),
            Arc::new(messenger.clone()),
            &events_config(Duration::from_millis(100)),
        )
    }

    fn msg(msg_type: &str, thread_id: &str) -> DidCommMsg {
        let mut msg = DidCommMsg::new(&serde_json::json!({ "@type": msg_type })).unwrap();
        msg.set_thread(Thread::with_id(thread_id)).unwrap();
        msg
    }

    #[tokio::test]
    async fn test_followups_run_and_persist_in_order() {
        let messenger = MockMessenger::new();
        let sm = machine(&messenger);

        let outcome = sm.handle_inbound(msg(PING, "t1"), "did:me", "did:you").await.unwrap();

        assert_eq!(outcome.state, "ponging");
        assert_eq!(sm.protocol().history("t1"), vec!["pinging", "ponging"]);
        assert_eq!(messenger.sent_of_type("test/pong").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_persisted_state() {
        let sm = machine(&MockMessenger::new());
        sm.protocol()
            .preset
            .lock()
            .unwrap()
            .insert("t1".to_string(), "bogus".to_string());

        let err = sm.handle_inbound(msg(PING, "t1"), "", "").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownState { ref state, .. } if state == "bogus"));
        assert!(sm.protocol().history("t1").is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_changes_nothing() {
        let messenger = MockMessenger::new();
        let sm = machine(&messenger);
        sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap();

        // ponging -> pinging
        let err = sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap_err();

        assert!(matches!(err, EngineError::IllegalTransition { .. }));
        assert_eq!(err.thread_id(), "t1");
        assert_eq!(sm.protocol().history("t1"), vec!["pinging", "ponging"]);
        assert_eq!(messenger.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_keeps_earlier_steps() {
        let messenger = MockMessenger::new();
        messenger.fail_with("unreachable");
        let sm = machine(&messenger);

        let err = sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap_err();

        assert!(matches!(err, EngineError::Send { ref state, .. } if state == "ponging"));
        assert_eq!(sm.protocol().history("t1"), vec!["pinging"]);
    }

    #[tokio::test]
    async fn test_noop_is_never_persisted() {
        let sm = machine(&MockMessenger::new());
        sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap();
        sm.handle_inbound(msg(FINISH, "t2"), "", "").await.unwrap();

        assert!(!sm.protocol().history("t1").contains(&"noop"));
        assert_eq!(sm.protocol().history("t2"), vec!["finished"]);
    }

    #[tokio::test]
    async fn test_terminal_state_absorbs_redelivery() {
        let sm = machine(&MockMessenger::new());
        let (tx, mut rx) = mpsc::channel(16);
        sm.register_msg_event(tx);
        sm.handle_inbound(msg(FINISH, "t1"), "", "").await.unwrap();
        for _ in 0..2 {
            rx.recv().await.unwrap();
        }

        let outcome = sm.handle_inbound(msg(PING, "t1"), "", "").await.unwrap();

        assert_eq!(outcome.state, "finished");
        assert_eq!(sm.protocol().history("t1"), vec!["finished"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let messenger = MockMessenger::new();
        let sm = StateMachine::new(
            ToyProtocol::default(),
            Arc::new(messenger.clone()),
            &events_config(Duration::from_millis(20)),
        );
        let (tx, _rx) = mpsc::channel(4);
        sm.register_action_event(tx).unwrap();

        let err = sm.handle_inbound(msg(PING, "t1"), "", "").await.unwrap_err();

        assert!(matches!(err, EngineError::ContinuationTimeout { .. }));
        assert!(sm.protocol().history("t1").is_empty());
        assert!(messenger.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_action_stop_routes_to_abandon_path() {
        let messenger = MockMessenger::new();
        let sm = machine(&messenger);
        let (tx, mut rx) = mpsc::channel::<ActionEvent<()>>(4);
        sm.register_action_event(tx).unwrap();

        tokio::spawn(async move {
            if let Some(event) = rx.recv().await {
                assert_eq!(event.state_id, "pinging");
                event.stop("not now");
            }
        });

        let outcome = sm.handle_inbound(msg(PING, "t1"), "", "").await.unwrap();

        assert_eq!(outcome.state, "finished");
        assert_eq!(sm.protocol().history("t1"), vec!["finished"]);
        assert!(messenger.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_action_event_stops() {
        let sm = machine(&MockMessenger::new());
        let (tx, mut rx) = mpsc::channel::<ActionEvent<()>>(4);
        sm.register_action_event(tx).unwrap();

        tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        let outcome = sm.handle_inbound(msg(PING, "t1"), "", "").await.unwrap();
        assert_eq!(outcome.state, "finished");
    }

    #[tokio::test]
    async fn test_closed_action_channel_continues() {
        let messenger = MockMessenger::new();
        let sm = machine(&messenger);
        let (tx, rx) = mpsc::channel::<ActionEvent<()>>(4);
        sm.register_action_event(tx).unwrap();
        drop(rx);

        let outcome = sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap();

        assert_eq!(outcome.state, "ponging");
        assert_eq!(messenger.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_state_events_bracket_each_step() {
        let sm = machine(&MockMessenger::new());
        let (tx, mut rx) = mpsc::channel(16);
        sm.register_msg_event(tx);

        sm.handle_inbound(msg(PING, "t1"), "", "did:you").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = rx.recv().await.unwrap();
            seen.push((event.kind, event.state_id));
        }
        assert_eq!(
            seen,
            vec![
                (StateMsgKind::PreState, "pinging"),
                (StateMsgKind::PostState, "pinging"),
                (StateMsgKind::PreState, "ponging"),
                (StateMsgKind::PostState, "ponging"),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_message_fails_before_any_step() {
        let sm = machine(&MockMessenger::new());
        let err = sm
            .handle_inbound(msg("test/other", "t1"), "", "")
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidMessage { .. }));
        assert!(sm.protocol().history("t1").is_empty());
    }
}
