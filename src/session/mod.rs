//! Sequencing of rounds over a training session.
//!
//! A [`SessionManager`] goes `CREATED -> RUNNING -> FINALIZED`, or ends in
//! `ABORTED` when a round cannot be completed within its retries. It owns the
//! current [`GlobalArtifact`] and hands it read-only to every round.

pub mod events;
mod validation;

pub use self::{
    events::{EventPublisher, EventSubscriber},
    validation::ParameterStatistics,
};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use displaydoc::Display;
use thiserror::Error;
use tokio::time::sleep;
use tracing::Instrument;

use crate::{
    aggregator::{AggregationError, Exclusion},
    common::{GlobalArtifact, Metrics},
    round::{
        Completion,
        RoundCoordinator,
        RoundError,
        RoundFailure,
        RoundIndex,
        RoundOutcome,
        RoundPlan,
        TaskResult,
        TaskStatus,
    },
    settings::{InsufficientClientsPolicy, SessionSettings},
    storage::SessionStore,
    transport::TaskKind,
};

/// Prefix of the metrics computed by an [`ArtifactValidator`].
pub const SERVER_METRICS_PREFIX: &str = "server_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Running,
    Finalized,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Succeeded,
    Partial,
    Failed,
}

/// One attempt at a round, as kept in the session history.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round: RoundIndex,
    pub kind: TaskKind,
    /// 1 for the first attempt at this round.
    pub attempt: u32,
    pub status: RoundStatus,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub metrics: Metrics,
    pub excluded: Vec<Exclusion>,
    pub results: Vec<TaskResult>,
    pub model_version: Option<RoundIndex>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RoundSummary {
    fn failed(round: RoundIndex, kind: TaskKind, attempt: u32, error: &RoundError) -> Self {
        let (selected, succeeded, failed, timed_out) = match error {
            RoundError::Failed(e) => (
                e.record.participants.len(),
                e.record.count(TaskStatus::Succeeded),
                e.record.count(TaskStatus::Failed),
                e.record.count(TaskStatus::TimedOut),
            ),
            _ => (0, 0, 0, 0),
        };
        let (results, excluded) = match error {
            RoundError::Failed(e) => {
                let excluded = match &e.reason {
                    RoundFailure::Aggregation(AggregationError::NoValidResults { excluded }) => {
                        excluded.clone()
                    }
                    RoundFailure::QuorumNotMet { .. } => Vec::new(),
                };
                (e.results.clone(), excluded)
            }
            _ => (Vec::new(), Vec::new()),
        };
        Self {
            round,
            kind,
            attempt,
            status: RoundStatus::Failed,
            selected,
            succeeded,
            failed,
            timed_out,
            metrics: Metrics::new(),
            excluded,
            results,
            model_version: None,
            error: Some(error.to_string()),
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub current_round: Option<RoundIndex>,
    pub rounds_completed: u32,
    pub total_rounds: u32,
    pub model_version: Option<RoundIndex>,
    /// Why the session was aborted.
    pub reason: Option<String>,
}

/// Errors returned by [`SessionManager::run`].
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session cannot be run in state {0:?}.
    NotRunnable(SessionState),
    /// The session was aborted in round {round}: {reason}.
    Aborted { round: RoundIndex, reason: String },
}

/// Evaluates a freshly aggregated artifact on the server side.
///
/// [`ParameterStatistics`] is installed when `validate_artifacts` is set;
/// embedders evaluating on held-out data plug in their own with
/// [`SessionManager::with_validator`].
#[async_trait]
pub trait ArtifactValidator: Send + Sync {
    async fn validate(&self, artifact: &GlobalArtifact) -> Result<Metrics, anyhow::Error>;
}

pub struct SessionManager {
    coordinator: RoundCoordinator,
    settings: SessionSettings,
    store: Arc<dyn SessionStore>,
    validator: Option<Arc<dyn ArtifactValidator>>,
    events: EventPublisher,
    state: SessionState,
    artifact: Arc<GlobalArtifact>,
    history: Vec<RoundSummary>,
    reason: Option<String>,
}

impl SessionManager {
    /// Create a session starting from a zeroed model of the configured size.
    pub fn new(
        coordinator: RoundCoordinator,
        settings: SessionSettings,
        store: Arc<dyn SessionStore>,
    ) -> (Self, EventSubscriber) {
        let artifact = GlobalArtifact::zeros(settings.model_size);
        Self::with_artifact(coordinator, settings, store, artifact)
    }

    pub fn with_artifact(
        coordinator: RoundCoordinator,
        settings: SessionSettings,
        store: Arc<dyn SessionStore>,
        artifact: GlobalArtifact,
    ) -> (Self, EventSubscriber) {
        let artifact = Arc::new(artifact);
        let status = SessionStatus {
            state: SessionState::Created,
            current_round: None,
            rounds_completed: 0,
            total_rounds: settings.rounds,
            model_version: artifact.version(),
            reason: None,
        };
        let (events, subscriber) = EventPublisher::init(status, artifact.clone());
        let validator: Option<Arc<dyn ArtifactValidator>> = if settings.validate_artifacts {
            Some(Arc::new(ParameterStatistics))
        } else {
            None
        };
        let manager = Self {
            coordinator,
            settings,
            store,
            validator,
            events,
            state: SessionState::Created,
            artifact,
            history: Vec::new(),
            reason: None,
        };
        (manager, subscriber)
    }

    pub fn with_validator(mut self, validator: Arc<dyn ArtifactValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The current global artifact: the final one once the session is
    /// finalized.
    pub fn artifact(&self) -> Arc<GlobalArtifact> {
        self.artifact.clone()
    }

    /// Every round attempt so far, in the order they ran.
    pub fn history(&self) -> &[RoundSummary] {
        &self.history
    }

    /// Run all rounds of the session.
    ///
    /// # Errors
    /// - [`SessionError::NotRunnable`] if the session already ran.
    /// - [`SessionError::Aborted`] if a round failed beyond its retries.
    pub async fn run(&mut self) -> Result<Arc<GlobalArtifact>, SessionError> {
        if self.state != SessionState::Created {
            warn!("rejecting run request: session is {:?}", self.state);
            return Err(SessionError::NotRunnable(self.state));
        }
        info!("starting session of {} round(s)", self.settings.rounds);
        self.state = SessionState::Running;
        self.publish_status(None).await;

        for index in 0..self.settings.rounds {
            let plan = self.plan(index);
            self.publish_status(Some(index)).await;
            self.run_round(index, &plan)
                .instrument(info_span!("session_round", round = index))
                .await?;
        }

        self.state = SessionState::Finalized;
        self.publish_status(None).await;
        info!(
            "session finalized with model version {:?}",
            self.artifact.version()
        );
        Ok(self.artifact.clone())
    }

    fn plan(&self, index: RoundIndex) -> RoundPlan {
        let kind = if index == 0 && self.settings.benchmark_first {
            TaskKind::Benchmark
        } else {
            TaskKind::Train
        };
        let task = &self.settings.task;
        RoundPlan {
            kind,
            dataset: task.dataset.clone(),
            model: task.model.clone(),
            hyperparams: task.hyperparams.clone(),
        }
    }

    async fn run_round(&mut self, index: RoundIndex, plan: &RoundPlan) -> Result<(), SessionError> {
        let mut attempt = 1;
        loop {
            let error = match self
                .coordinator
                .run_round(index, plan, &self.artifact)
                .await
            {
                Ok(outcome) => {
                    self.complete_round(index, attempt, outcome).await;
                    return Ok(());
                }
                Err(error) => error,
            };
            warn!("round {} attempt {} failed: {}", index, attempt, error);
            self.record(RoundSummary::failed(index, plan.kind, attempt, &error))
                .await;

            match &error {
                RoundError::Registry(_) => return Err(self.abort(index, error.to_string()).await),
                RoundError::InsufficientClients(_)
                    if self.settings.on_insufficient_clients == InsufficientClientsPolicy::Abort =>
                {
                    return Err(self.abort(index, error.to_string()).await)
                }
                _ => {}
            }
            if attempt > self.settings.max_round_retries {
                let reason = format!("{} (after {} attempt(s))", error, attempt);
                return Err(self.abort(index, reason).await);
            }
            attempt += 1;
            sleep(self.settings.retry_delay()).await;
        }
    }

    async fn complete_round(&mut self, index: RoundIndex, attempt: u32, outcome: RoundOutcome) {
        let RoundOutcome {
            record,
            artifact,
            report,
            results,
            completion,
        } = outcome;

        let mut metrics = report.metrics;
        if let Some(validator) = self.validator.as_ref() {
            match validator.validate(&artifact).await {
                Ok(server_metrics) => {
                    metrics.extend(
                        server_metrics
                            .into_iter()
                            .map(|(name, value)| (format!("{}{}", SERVER_METRICS_PREFIX, name), value)),
                    );
                }
                Err(e) => warn!("server side validation of round {} failed: {}", index, e),
            }
        }

        let summary = RoundSummary {
            round: index,
            kind: record.kind,
            attempt,
            status: match completion {
                Completion::Full => RoundStatus::Succeeded,
                Completion::Partial => RoundStatus::Partial,
            },
            selected: record.participants.len(),
            succeeded: record.count(TaskStatus::Succeeded),
            failed: record.count(TaskStatus::Failed),
            timed_out: record.count(TaskStatus::TimedOut),
            metrics,
            excluded: report.excluded,
            results,
            model_version: artifact.version(),
            error: None,
            finished_at: Utc::now(),
        };
        info!(
            "round {} done ({:?}): {}/{} succeeded",
            index, summary.status, summary.succeeded, summary.selected
        );

        self.artifact = Arc::new(artifact);
        if let Err(e) = self.store.save_artifact(&self.artifact).await {
            error!("failed to persist artifact of round {}: {:?}", index, e);
        }
        self.events.broadcast_model(self.artifact.clone());
        self.record(summary).await;
    }

    async fn record(&mut self, summary: RoundSummary) {
        if let Err(e) = self.store.save_round(&summary).await {
            error!("failed to persist round {}: {:?}", summary.round, e);
        }
        self.history.push(summary);
        self.events.broadcast_history(Arc::new(self.history.clone()));
    }

    async fn abort(&mut self, index: RoundIndex, reason: String) -> SessionError {
        error!("aborting session in round {}: {}", index, reason);
        self.state = SessionState::Aborted;
        self.reason = Some(reason.clone());
        self.publish_status(Some(index)).await;
        SessionError::Aborted {
            round: index,
            reason,
        }
    }

    fn status(&self, current_round: Option<RoundIndex>) -> SessionStatus {
        SessionStatus {
            state: self.state,
            current_round,
            rounds_completed: self
                .history
                .iter()
                .filter(|s| s.status != RoundStatus::Failed)
                .count() as u32,
            total_rounds: self.settings.rounds,
            model_version: self.artifact.version(),
            reason: self.reason.clone(),
        }
    }

    async fn publish_status(&self, current_round: Option<RoundIndex>) {
        let status = self.status(current_round);
        if let Err(e) = self.store.save_status(&status).await {
            error!("failed to persist session status: {:?}", e);
        }
        self.events.broadcast_status(status);
    }
}
