//! Introduce protocol.
//!
//! An introducer brokers a connection between two introducees:
//!
//! 1. Proposal to the first introducee (sent by the application, or by the
//!    engine after an introducee's Request)
//! 2. Each Response is counted; the first triggers the second proposal
//!    (unless the introducer already carries an invitation)
//! 3. After the second Response the shared invitation is relayed to the other
//!    introducee and the sharer is acknowledged
//!
//! Refusals short-circuit through `abandoning`.

pub mod messages;
pub mod metadata;
pub mod protocol;
pub mod states;

pub use messages::{Ack, ProblemReport, Proposal, Request, Response, To};
pub use metadata::{
    default_skip_proposal, IntroduceContext, IntroduceRecord, Recipient, SkipProposal,
};
pub use protocol::{Introduce, IntroduceOptions, IntroduceService, INTRODUCE_PROTOCOL};
pub use states::{to_dest_idx, IntroduceState};
