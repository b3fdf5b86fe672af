use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinSet,
    time::{sleep, sleep_until, timeout, Instant},
};
use tracing::Instrument;

use super::{
    Completion,
    InsufficientClientsError,
    Round,
    RoundError,
    RoundFailedError,
    RoundFailure,
    RoundIndex,
    RoundOutcome,
    RoundPhase,
    RoundPlan,
    Selector,
    TaskResult,
    TaskStatus,
};
use crate::{
    aggregator::Aggregator,
    common::{ClientId, Endpoint, GlobalArtifact},
    registry::RegistryHandle,
    round::retry::RetryPolicy,
    settings::RoundSettings,
    transport::{ClientTaskError, TaskEnvelope, TaskPayload, TaskRequest, TaskTransport},
};

/// Drives a round through selection, dispatch, collection and aggregation.
pub struct RoundCoordinator {
    registry: RegistryHandle,
    transport: Arc<dyn TaskTransport>,
    aggregator: Arc<dyn Aggregator>,
    selector: Box<dyn Selector>,
    settings: RoundSettings,
}

/// What a client task returns once it gave up or succeeded.
struct ClientOutcome {
    client_id: ClientId,
    result: Result<TaskPayload, ClientTaskError>,
}

impl RoundCoordinator {
    pub fn new(
        registry: RegistryHandle,
        transport: Arc<dyn TaskTransport>,
        aggregator: Arc<dyn Aggregator>,
        settings: RoundSettings,
    ) -> Self {
        Self {
            registry,
            transport,
            aggregator,
            selector: settings.sampling.selector(),
            settings,
        }
    }

    /// Replace the selector derived from the sampling policy.
    pub fn with_selector(mut self, selector: Box<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Run round `index` of `plan` starting from `artifact`.
    ///
    /// # Errors
    /// - [`RoundError::InsufficientClients`] when fewer than `min_clients`
    ///   clients are eligible. Nothing was dispatched.
    /// - [`RoundError::Failed`] when fewer than `min_success` clients succeeded
    ///   or none of their results could be aggregated.
    pub async fn run_round(
        &self,
        index: RoundIndex,
        plan: &RoundPlan,
        artifact: &GlobalArtifact,
    ) -> Result<RoundOutcome, RoundError> {
        let span = info_span!("round", round = index, kind = %plan.kind);
        self.run(index, plan, artifact).instrument(span).await
    }

    async fn run(
        &self,
        index: RoundIndex,
        plan: &RoundPlan,
        artifact: &GlobalArtifact,
    ) -> Result<RoundOutcome, RoundError> {
        let mut round = Round::new(index, plan.kind);
        round.transition(RoundPhase::Selecting);

        let eligible = self
            .registry
            .list_eligible(plan.required_capabilities())
            .await?;
        self.ensure_enough(index, eligible.len())?;

        let selected = self.selector.select(index, eligible);
        let ids: Vec<ClientId> = selected.iter().map(|c| c.id).collect();
        let busy = self.registry.mark_busy(ids).await?;
        // clients that went away between listing and marking are dropped
        let selected: Vec<_> = selected
            .into_iter()
            .filter(|c| busy.contains(&c.id))
            .collect();
        if let Err(e) = self.ensure_enough(index, selected.len()) {
            self.release(busy);
            return Err(e.into());
        }
        info!("selected {} client(s)", selected.len());
        round.select(&selected, self.settings.deadline());

        let result = self.drive(round, plan, artifact).await;
        self.release(busy);
        result
    }

    fn ensure_enough(
        &self,
        index: RoundIndex,
        eligible: usize,
    ) -> Result<(), InsufficientClientsError> {
        if eligible < self.settings.min_clients {
            warn!(
                "not enough eligible clients: {} < {}",
                eligible, self.settings.min_clients
            );
            return Err(InsufficientClientsError {
                round: index,
                eligible,
                required: self.settings.min_clients,
            });
        }
        Ok(())
    }

    fn release(&self, ids: Vec<ClientId>) {
        if self.registry.release(ids).is_err() {
            warn!("could not release participants: registry is gone");
        }
    }

    async fn drive(
        &self,
        mut round: Round,
        plan: &RoundPlan,
        artifact: &GlobalArtifact,
    ) -> Result<RoundOutcome, RoundError> {
        let index = round.index;
        round.transition(RoundPhase::Dispatching);
        let request = plan.request(artifact);
        let mut tasks = JoinSet::new();
        let mut attempts: HashMap<ClientId, Arc<AtomicU32>> = HashMap::new();
        for participant in round.participants.clone() {
            let counter = Arc::new(AtomicU32::new(0));
            attempts.insert(participant.client_id, counter.clone());
            tasks.spawn(
                run_client_task(
                    self.transport.clone(),
                    participant.endpoint,
                    index,
                    participant.client_id,
                    request.clone(),
                    self.settings.rpc_timeout(),
                    self.settings.retry,
                    counter,
                )
                .instrument(debug_span!("client_task", client_id = %participant.client_id)),
            );
            round.set_status(participant.client_id, TaskStatus::Dispatched);
        }

        round.transition(RoundPhase::Awaiting);
        let mut outcomes: HashMap<ClientId, ClientOutcome> = HashMap::new();
        let deadline = sleep_until(Instant::now() + self.settings.deadline());
        tokio::pin!(deadline);
        let mut deadline_elapsed = false;
        loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(Ok(outcome)) => {
                        let status = match &outcome.result {
                            Ok(_) => TaskStatus::Succeeded,
                            Err(ClientTaskError::Timeout(_)) => TaskStatus::TimedOut,
                            Err(ClientTaskError::Rpc(_)) => TaskStatus::Failed,
                        };
                        debug!("client {} finished: {:?}", outcome.client_id, status);
                        if round.set_status(outcome.client_id, status) {
                            outcomes.insert(outcome.client_id, outcome);
                        }
                    }
                    Some(Err(e)) => error!("client task died: {}", e),
                    None => break,
                },
                _ = &mut deadline => {
                    deadline_elapsed = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        let outstanding: Vec<ClientId> = round
            .participants
            .iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.client_id)
            .collect();
        if !outstanding.is_empty() {
            let status = if deadline_elapsed {
                warn!("deadline elapsed with {} client(s) outstanding", outstanding.len());
                TaskStatus::TimedOut
            } else {
                TaskStatus::Failed
            };
            for id in outstanding {
                round.set_status(id, status);
            }
        }

        let results: Vec<TaskResult> = round
            .participants
            .iter()
            .map(|p| {
                let (payload, error) = match outcomes.remove(&p.client_id).map(|o| o.result) {
                    Some(Ok(payload)) => (Some(payload), None),
                    Some(Err(e)) => (None, Some(e.to_string())),
                    None if deadline_elapsed => (None, Some("round deadline elapsed".to_string())),
                    None => (None, Some("client task died".to_string())),
                };
                TaskResult {
                    client_id: p.client_id,
                    round: index,
                    kind: plan.kind,
                    status: p.status,
                    payload,
                    error,
                    attempts: attempts
                        .get(&p.client_id)
                        .map(|counter| counter.load(Ordering::SeqCst))
                        .unwrap_or_default(),
                }
            })
            .collect();

        let succeeded = round.count(TaskStatus::Succeeded);
        info!(
            "{} succeeded, {} failed, {} timed out",
            succeeded,
            round.count(TaskStatus::Failed),
            round.count(TaskStatus::TimedOut)
        );
        if succeeded < self.settings.min_success {
            round.transition(RoundPhase::Failed);
            return Err(RoundFailedError {
                round: index,
                reason: RoundFailure::QuorumNotMet {
                    succeeded,
                    required: self.settings.min_success,
                },
                record: Box::new(round),
                results,
            }
            .into());
        }
        let completion = if succeeded == round.participants.len() {
            Completion::Full
        } else {
            round.transition(RoundPhase::PartialFailure);
            Completion::Partial
        };

        round.transition(RoundPhase::Aggregating);
        let successes: Vec<TaskResult> = results
            .iter()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .cloned()
            .collect();
        match self
            .aggregator
            .aggregate(index, plan.kind, artifact, &successes)
        {
            Ok(aggregation) => {
                round.transition(RoundPhase::Done);
                Ok(RoundOutcome {
                    record: round,
                    artifact: aggregation.artifact,
                    report: aggregation.report,
                    results,
                    completion,
                })
            }
            Err(e) => {
                round.transition(RoundPhase::Failed);
                Err(RoundFailedError {
                    round: index,
                    reason: e.into(),
                    record: Box::new(round),
                    results,
                }
                .into())
            }
        }
    }
}

/// Run a task on one client, retrying failed attempts with backoff. Every
/// attempt is counted in `attempts` as soon as it starts.
#[allow(clippy::too_many_arguments)]
async fn run_client_task(
    transport: Arc<dyn TaskTransport>,
    endpoint: Endpoint,
    round: RoundIndex,
    client_id: ClientId,
    request: TaskRequest,
    rpc_timeout: Duration,
    retry: RetryPolicy,
    attempts: Arc<AtomicU32>,
) -> ClientOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::SeqCst);
        let envelope = TaskEnvelope {
            round,
            client_id,
            attempt,
            request: request.clone(),
        };
        let result = match timeout(rpc_timeout, transport.call(&endpoint, envelope)).await {
            Ok(result) => result,
            Err(_) => Err(ClientTaskError::Timeout(rpc_timeout)),
        };
        match result {
            Err(e) if attempt < retry.max_attempts() => {
                let backoff = retry.backoff(attempt);
                debug!("attempt {} failed: {}, retrying in {:?}", attempt, e, backoff);
                sleep(backoff).await;
            }
            result => return ClientOutcome { client_id, result },
        }
    }
}
