//! A single round: select participants, dispatch tasks, collect the results
//! and aggregate them.

pub mod coordinator;
pub mod error;
pub mod retry;
pub mod selector;

pub use self::{
    coordinator::RoundCoordinator,
    error::{InsufficientClientsError, RoundError, RoundFailedError, RoundFailure},
    retry::RetryPolicy,
    selector::{SamplingPolicy, Selector},
};

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::{
    aggregator::AggregationReport,
    common::{Capabilities, ClientId, Endpoint, GlobalArtifact},
    registry::Client,
    transport::{TaskKind, TaskPayload, TaskRequest},
};

pub type RoundIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Init,
    Selecting,
    Dispatching,
    Awaiting,
    PartialFailure,
    Aggregating,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }
}

/// The recorded outcome of one client's task in one round.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub client_id: ClientId,
    pub round: RoundIndex,
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(skip)]
    pub payload: Option<TaskPayload>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub client_id: ClientId,
    pub endpoint: Endpoint,
    pub status: TaskStatus,
}

/// The record of a round, kept by the coordinator while the round runs.
#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub index: RoundIndex,
    pub kind: TaskKind,
    pub phase: RoundPhase,
    /// The participants, in selection order.
    pub participants: Vec<Participant>,
    /// The participants that reached a terminal status, in arrival order.
    pub arrivals: Vec<ClientId>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl Round {
    pub fn new(index: RoundIndex, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            index,
            kind,
            phase: RoundPhase::Init,
            participants: Vec::new(),
            arrivals: Vec::new(),
            started_at: now,
            deadline: now,
        }
    }

    /// Record the selected clients and start the clock.
    pub fn select(&mut self, selected: &[Client], deadline: Duration) {
        self.participants = selected
            .iter()
            .map(|client| Participant {
                client_id: client.id,
                endpoint: client.endpoint.clone(),
                status: TaskStatus::Pending,
            })
            .collect();
        self.started_at = Utc::now();
        self.deadline = ChronoDuration::from_std(deadline)
            .ok()
            .and_then(|d| self.started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn transition(&mut self, phase: RoundPhase) {
        debug!("round {}: {:?} -> {:?}", self.index, self.phase, phase);
        self.phase = phase;
    }

    /// Update the status of a participant. Terminal statuses are final:
    /// returns `false` if the participant is unknown or already terminal.
    pub fn set_status(&mut self, id: ClientId, status: TaskStatus) -> bool {
        let participant = match self.participants.iter_mut().find(|p| p.client_id == id) {
            Some(participant) if !participant.status.is_terminal() => participant,
            _ => return false,
        };
        participant.status = status;
        if status.is_terminal() {
            self.arrivals.push(id);
        }
        true
    }

    pub fn status(&self, id: &ClientId) -> Option<TaskStatus> {
        self.participants
            .iter()
            .find(|p| &p.client_id == id)
            .map(|p| p.status)
    }

    /// A round is complete when every participant reached a terminal status.
    pub fn is_complete(&self) -> bool {
        self.participants.iter().all(|p| p.status.is_terminal())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status == status)
            .count()
    }
}

/// What a round asks of its participants.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundPlan {
    pub kind: TaskKind,
    pub dataset: String,
    pub model: String,
    pub hyperparams: BTreeMap<String, f64>,
}

impl RoundPlan {
    /// The request sent to every participant, carrying the current parameters
    /// where the task needs them.
    pub fn request(&self, artifact: &GlobalArtifact) -> TaskRequest {
        let dataset = self.dataset.clone();
        let model = self.model.clone();
        match self.kind {
            TaskKind::Benchmark => TaskRequest::Benchmark { dataset, model },
            TaskKind::Train => TaskRequest::Train {
                dataset,
                model,
                hyperparams: self.hyperparams.clone(),
                parameters: artifact.shared_parameters(),
            },
            TaskKind::Validate => TaskRequest::Validate {
                dataset,
                model,
                parameters: artifact.shared_parameters(),
            },
        }
    }

    /// Clients need the dataset and the model of the plan.
    pub fn required_capabilities(&self) -> Capabilities {
        Capabilities::new(vec![self.dataset.clone()], vec![self.model.clone()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Every participant succeeded.
    Full,
    /// Some participants failed or timed out, but the quorum was met.
    Partial,
}

/// A round that reached DONE.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub record: Round,
    pub artifact: GlobalArtifact,
    pub report: AggregationReport,
    /// One result per participant, in selection order.
    pub results: Vec<TaskResult>,
    pub completion: Completion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientStatus;

    fn client(port: u16) -> Client {
        Client {
            id: ClientId::new(),
            endpoint: Endpoint::new("127.0.0.1", port),
            capabilities: Capabilities::default(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            status: ClientStatus::Registered,
        }
    }

    #[test]
    fn test_terminal_status_is_final() {
        let clients = vec![client(1), client(2)];
        let mut round = Round::new(0, TaskKind::Train);
        round.select(&clients, Duration::from_secs(10));
        assert!(round.deadline > round.started_at);

        let a = clients[0].id;
        let b = clients[1].id;
        assert!(round.set_status(a, TaskStatus::Dispatched));
        assert!(round.set_status(b, TaskStatus::Dispatched));
        assert!(!round.is_complete());

        assert!(round.set_status(b, TaskStatus::Succeeded));
        assert!(!round.set_status(b, TaskStatus::Failed));
        assert!(round.set_status(a, TaskStatus::TimedOut));
        assert!(!round.set_status(ClientId::new(), TaskStatus::Succeeded));

        assert!(round.is_complete());
        assert_eq!(round.status(&b), Some(TaskStatus::Succeeded));
        assert_eq!(round.arrivals, vec![b, a]);
        assert_eq!(round.count(TaskStatus::Succeeded), 1);
    }

    #[test]
    fn test_plan_request() {
        let plan = RoundPlan {
            kind: TaskKind::Validate,
            dataset: "mnist".into(),
            model: "cnn".into(),
            hyperparams: BTreeMap::new(),
        };
        let artifact = GlobalArtifact::initial(vec![1.0]);
        match plan.request(&artifact) {
            TaskRequest::Validate { parameters, .. } => assert_eq!(*parameters, vec![1.0]),
            other => panic!("unexpected request {:?}", other),
        }
        let required = plan.required_capabilities();
        assert!(required.datasets.contains("mnist"));
        assert!(required.models.contains("cnn"));
    }
}
