//! DIDComm message envelope and the messenger boundary.
//!
//! - [`DidCommMsg`]: a type-tagged JSON message with a `~thread` decorator
//! - [`Messenger`]: send / reply-to / reply-to-nested, implemented by the
//!   transport layer (out of scope) or by [`MockMessenger`] in tests

pub mod message;
pub mod messenger;
pub mod mock;

pub use message::{DidCommMsg, MessageError, MessageResult, Thread};
pub use messenger::{Messenger, MessengerError, MessengerResult};
pub use mock::{MockMessenger, SendKind, SentMessage};
