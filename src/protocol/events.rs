//! Action and state-message events.
//!
//! ## Delivery
//!
//! - Action events go to at most one registered channel. The engine blocks
//!   the thread until the event's continuation is answered (or times out).
//! - State messages fan out to every registered channel. Each subscriber
//!   gets one bounded queue drained in order by one forwarding task, so
//!   publishing never blocks a transition. An event published while the
//!   queue is full is dropped, as is an event the subscriber does not accept
//!   within the publish timeout. Closed channels are unregistered on the
//!   next publish.

use crate::didcomm::DidCommMsg;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Property key carrying the connection id.
pub const PROPERTY_CONNECTION_ID: &str = "connectionID";

/// Property key carrying the invitation id.
pub const PROPERTY_INVITATION_ID: &str = "invitationID";

/// Event registration errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("an action event channel is already registered")]
    AlreadyRegistered,
}

/// Application decision on an action event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<O> {
    /// Proceed, with protocol-specific options.
    Continue(O),
    /// Do not proceed; the protocol routes to its abandon path.
    Stop(String),
}

/// Correlation properties attached to events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.get(PROPERTY_CONNECTION_ID)
    }

    pub fn invitation_id(&self) -> Option<&str> {
        self.get(PROPERTY_INVITATION_ID)
    }
}

/// Event requiring an application decision before the thread proceeds.
#[derive(Debug)]
pub struct ActionEvent<O> {
    pub protocol: &'static str,
    pub thread_id: String,
    /// State the engine will enter on continue.
    pub state_id: &'static str,
    pub message: DidCommMsg,
    pub properties: Properties,
    continuation: oneshot::Sender<Decision<O>>,
}

impl<O> ActionEvent<O> {
    pub(crate) fn new(
        protocol: &'static str,
        thread_id: String,
        state_id: &'static str,
        message: DidCommMsg,
        properties: Properties,
    ) -> (Self, oneshot::Receiver<Decision<O>>) {
        let (tx, rx) = oneshot::channel();
        let event = Self {
            protocol,
            thread_id,
            state_id,
            message,
            properties,
            continuation: tx,
        };
        (event, rx)
    }

    /// Proceed with `options`.
    pub fn continue_with(self, options: O) {
        self.decide(Decision::Continue(options));
    }

    /// Refuse; the thread routes to its abandon path.
    pub fn stop(self, reason: impl Into<String>) {
        self.decide(Decision::Stop(reason.into()));
    }

    pub fn decide(self, decision: Decision<O>) {
        // the engine may already have timed out and gone away
        if self.continuation.send(decision).is_err() {
            tracing::debug!(thread_id = %self.thread_id, "Continuation no longer awaited");
        }
    }
}

/// Pre or post state observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMsgKind {
    PreState,
    PostState,
}

/// Informational state event.
#[derive(Debug, Clone)]
pub struct StateMsg {
    pub protocol: &'static str,
    pub thread_id: String,
    pub kind: StateMsgKind,
    pub state_id: &'static str,
    pub message: DidCommMsg,
    pub properties: Properties,
}

/// A registered state-message channel and the queue feeding it.
struct Subscriber {
    channel: mpsc::Sender<StateMsg>,
    queue: mpsc::Sender<StateMsg>,
}

impl Subscriber {
    fn spawn(channel: mpsc::Sender<StateMsg>, capacity: usize, publish_timeout: Duration) -> Self {
        let (queue, mut pending) = mpsc::channel::<StateMsg>(capacity.max(1));
        let forward_to = channel.clone();

        tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                match tokio::time::timeout(publish_timeout, forward_to.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => tracing::warn!(
                        timeout = ?publish_timeout,
                        "Dropped state event: subscriber did not keep up"
                    ),
                }
            }
        });

        Self { channel, queue }
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed() || self.queue.is_closed()
    }
}

/// Fans events out to registered application channels.
pub struct EventDispatcher<O> {
    action: Mutex<Option<mpsc::Sender<ActionEvent<O>>>>,
    msg: Mutex<Vec<Subscriber>>,
    publish_timeout: Duration,
    queue_capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<O: Send + 'static> EventDispatcher<O> {
    pub fn new(publish_timeout: Duration, queue_capacity: usize) -> Self {
        Self {
            action: Mutex::new(None),
            msg: Mutex::new(Vec::new()),
            publish_timeout,
            queue_capacity,
        }
    }

    /// Register the action-event channel.
    pub fn register_action_event(&self, tx: mpsc::Sender<ActionEvent<O>>) -> Result<(), EventError> {
        let mut action = lock(&self.action);
        match action.as_ref() {
            Some(existing) if !existing.is_closed() => Err(EventError::AlreadyRegistered),
            _ => {
                *action = Some(tx);
                Ok(())
            }
        }
    }

    pub fn unregister_action_event(&self) {
        *lock(&self.action) = None;
    }

    /// Register a state-message channel (any number may be registered).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_msg_event(&self, tx: mpsc::Sender<StateMsg>) {
        let subscriber = Subscriber::spawn(tx, self.queue_capacity, self.publish_timeout);
        lock(&self.msg).push(subscriber);
    }

    /// Dropping the subscriber's queue ends its forwarding task once drained.
    pub fn unregister_msg_event(&self, tx: &mpsc::Sender<StateMsg>) {
        lock(&self.msg).retain(|existing| !existing.channel.same_channel(tx));
    }

    pub(crate) fn action_sender(&self) -> Option<mpsc::Sender<ActionEvent<O>>> {
        lock(&self.action).clone()
    }

    /// Publish a state message without blocking.
    pub fn publish(&self, event: StateMsg) {
        let mut subscribers = lock(&self.msg);
        subscribers.retain(|subscriber| !subscriber.is_closed());

        for subscriber in subscribers.iter() {
            match subscriber.queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => tracing::warn!(
                    thread_id = %dropped.thread_id,
                    state = dropped.state_id,
                    "Dropped state event: subscriber queue full"
                ),
                // forwarding task ended; removed on the next publish
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Continue every action event received on `rx` with default options.
pub fn auto_execute_action_events<O>(mut rx: mpsc::Receiver<ActionEvent<O>>) -> JoinHandle<()>
where
    O: Default + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::debug!(
                protocol = event.protocol,
                thread_id = %event.thread_id,
                state = event.state_id,
                "Auto-continuing action event"
            );
            event.continue_with(O::default());
        }
    })
}
