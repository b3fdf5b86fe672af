//! Round orchestration for a federated learning server.
//!
//! The coordinator keeps track of the clients that announced themselves on the
//! control channel, selects participants for every training round, dispatches
//! tasks to them over the task RPC channel and folds their results into a new
//! global model.
//!
//! The crate is organised leaf-first:
//!
//! - [`registry`]: client membership and liveness, behind a single-writer service.
//! - [`transport`]: the control (pub/sub) and task (RPC) channel adapters.
//! - [`round`]: the per-round state machine.
//! - [`aggregator`]: deterministic reduction of round results.
//! - [`session`]: sequencing of rounds and ownership of the global artifact.

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub mod aggregator;
pub mod common;
pub mod registry;
pub mod rest;
pub mod round;
pub mod session;
pub mod settings;
pub mod storage;
pub mod transport;
