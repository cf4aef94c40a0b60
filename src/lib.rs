//! didcomm-engine - DIDComm protocol state machines with durable connections
//!
//! Runs the asynchronous, threaded protocols that DIDComm agents use to build
//! relationships and broker higher-order interactions.
//!
//! Key principles:
//! - One generic engine for every sub-protocol (legality checks, followup loop,
//!   action/state events, per-thread persistence)
//! - Per-thread mutual exclusion, full parallelism across threads
//! - Protocol progress and connection records survive process restarts
//! - Transport, envelope crypto and DID resolution stay behind traits

pub mod config;
pub mod connection;
pub mod didcomm;
pub mod didexchange;
pub mod introduce;
pub mod protocol;
pub mod storage;
