//! Connection-exchange protocol.
//!
//! ```text
//! inviter                                 invitee
//!   create_invitation  ── invitation ──▶  invited
//!   requested          ◀── request ────   requested
//!   responded          ── response ───▶   responded
//!   completed          ◀──── ack ──────   completed
//! ```
//!
//! Receiving an invitation or a request raises an action event. A stopped
//! exchange is recorded as `abandoned`; nothing is sent.

pub mod messages;
pub mod protocol;
pub mod states;

pub use messages::{
    Ack, Invitation, Request, Response, ACK_MSG_TYPE, INVITATION_MSG_TYPE, REQUEST_MSG_TYPE,
    RESPONSE_MSG_TYPE,
};
pub use protocol::{
    DidExchange, ExchangeContext, ExchangeOptions, ExchangeService, DIDEXCHANGE_PROTOCOL,
};
pub use states::ExchangeState;
