use thiserror::Error;

use super::{Round, RoundIndex, TaskResult};
use crate::{aggregator::AggregationError, registry::RegistryError};

/// Too few clients were eligible to start the round.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("round {round}: {eligible} eligible client(s), {required} required")]
pub struct InsufficientClientsError {
    pub round: RoundIndex,
    pub eligible: usize,
    pub required: usize,
}

#[derive(Debug, Error)]
pub enum RoundFailure {
    #[error("{succeeded} client(s) succeeded, {required} required")]
    QuorumNotMet { succeeded: usize, required: usize },
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
}

/// The round ran but did not produce a new artifact.
#[derive(Debug, Error)]
#[error("round {round} failed: {reason}")]
pub struct RoundFailedError {
    pub round: RoundIndex,
    pub reason: RoundFailure,
    /// The state of the round when it failed.
    pub record: Box<Round>,
    /// The result of every participant, in selection order.
    pub results: Vec<TaskResult>,
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    InsufficientClients(#[from] InsufficientClientsError),
    #[error(transparent)]
    Failed(#[from] RoundFailedError),
    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}
