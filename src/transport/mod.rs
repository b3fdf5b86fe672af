//! The two channels between the coordinator and its clients.
//!
//! The control channel is a lightweight pub/sub channel used by clients to
//! register and to send heartbeats. The task channel is a point-to-point RPC
//! channel used by the coordinator to run tasks on a client and to move model
//! parameters back and forth.

pub mod control;
pub mod rpc;
pub mod task;

pub use self::task::{
    ClientTaskError,
    EvaluationReport,
    ModelUpdate,
    TaskEnvelope,
    TaskExecutor,
    TaskFailure,
    TaskKind,
    TaskPayload,
    TaskRequest,
    TaskTransport,
};
