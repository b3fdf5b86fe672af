use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use displaydoc::Display;
use thiserror::Error;

use crate::common::{ClientId, Endpoint, Metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Benchmark,
    Train,
    Validate,
}

impl TaskKind {
    /// Whether a successful task of this kind returns a model update.
    pub fn produces_model(&self) -> bool {
        matches!(self, TaskKind::Train)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Benchmark => write!(f, "benchmark"),
            TaskKind::Train => write!(f, "train"),
            TaskKind::Validate => write!(f, "validate"),
        }
    }
}

/// The work a client is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Measure how the client performs on a dataset and model, without
    /// changing any parameters.
    Benchmark { dataset: String, model: String },
    /// Train locally from `parameters` and return the resulting delta.
    Train {
        dataset: String,
        model: String,
        hyperparams: BTreeMap<String, f64>,
        parameters: Arc<Vec<f32>>,
    },
    /// Evaluate `parameters` on local data.
    Validate {
        dataset: String,
        model: String,
        parameters: Arc<Vec<f32>>,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::Benchmark { .. } => TaskKind::Benchmark,
            TaskRequest::Train { .. } => TaskKind::Train,
            TaskRequest::Validate { .. } => TaskKind::Validate,
        }
    }
}

/// A task addressed to one client in one round.
///
/// The `(round, client_id, kind)` triple identifies the task: a client
/// receiving the same triple twice, for instance after a retry, may return
/// its previous result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub round: u32,
    pub client_id: ClientId,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub request: TaskRequest,
}

/// A locally trained model, expressed as the difference to the parameters
/// the client started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub delta: Vec<f32>,
    pub num_samples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub metrics: Metrics,
    pub num_samples: u64,
}

/// What a client returns for a successful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    Metrics(EvaluationReport),
    Model(ModelUpdate),
}

impl TaskPayload {
    pub fn num_samples(&self) -> u64 {
        match self {
            TaskPayload::Metrics(report) => report.num_samples,
            TaskPayload::Model(update) => update.num_samples,
        }
    }
}

/// A task failure reported by the client itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{0}")]
pub struct TaskFailure(pub String);

/// Why a single attempt at running a task on a client failed.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ClientTaskError {
    /// no answer within {0:?}
    Timeout(Duration),
    /// rpc failed: {0}
    Rpc(String),
}

impl From<TaskFailure> for ClientTaskError {
    fn from(failure: TaskFailure) -> Self {
        ClientTaskError::Rpc(failure.0)
    }
}

/// The coordinator side of the task channel.
#[async_trait]
pub trait TaskTransport: Send + Sync + 'static {
    /// Run a task on the client listening at `endpoint`.
    ///
    /// Implementations do not need to enforce a timeout: the caller bounds
    /// every call.
    async fn call(
        &self,
        endpoint: &Endpoint,
        envelope: TaskEnvelope,
    ) -> Result<TaskPayload, ClientTaskError>;
}

/// The client side of the task channel.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn benchmark(&self, dataset: &str, model: &str) -> Result<EvaluationReport, TaskFailure>;

    async fn train(
        &self,
        dataset: &str,
        model: &str,
        hyperparams: &BTreeMap<String, f64>,
        parameters: &[f32],
    ) -> Result<ModelUpdate, TaskFailure>;

    async fn validate(
        &self,
        dataset: &str,
        model: &str,
        parameters: &[f32],
    ) -> Result<EvaluationReport, TaskFailure>;
}

/// Run the task of `envelope` on `executor`. This is the single entry point
/// through which every task type is dispatched on the client.
pub async fn execute(
    executor: &dyn TaskExecutor,
    envelope: TaskEnvelope,
) -> Result<TaskPayload, TaskFailure> {
    debug!(
        "running {} task of round {} (attempt {})",
        envelope.request.kind(),
        envelope.round,
        envelope.attempt
    );
    match envelope.request {
        TaskRequest::Benchmark { dataset, model } => executor
            .benchmark(&dataset, &model)
            .await
            .map(TaskPayload::Metrics),
        TaskRequest::Train {
            dataset,
            model,
            hyperparams,
            parameters,
        } => executor
            .train(&dataset, &model, &hyperparams, &parameters)
            .await
            .map(TaskPayload::Model),
        TaskRequest::Validate {
            dataset,
            model,
            parameters,
        } => executor
            .validate(&dataset, &model, &parameters)
            .await
            .map(TaskPayload::Metrics),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn benchmark(&self, _: &str, _: &str) -> Result<EvaluationReport, TaskFailure> {
            Ok(EvaluationReport {
                metrics: vec![("throughput".to_string(), 10.0)].into_iter().collect(),
                num_samples: 1,
            })
        }

        async fn train(
            &self,
            _: &str,
            _: &str,
            _: &BTreeMap<String, f64>,
            parameters: &[f32],
        ) -> Result<ModelUpdate, TaskFailure> {
            Ok(ModelUpdate {
                delta: parameters.to_vec(),
                num_samples: 3,
                metrics: Metrics::new(),
            })
        }

        async fn validate(&self, _: &str, _: &str, _: &[f32]) -> Result<EvaluationReport, TaskFailure> {
            Err(TaskFailure("no validation data".to_string()))
        }
    }

    fn envelope(request: TaskRequest) -> TaskEnvelope {
        TaskEnvelope {
            round: 0,
            client_id: ClientId::new(),
            attempt: 1,
            request,
        }
    }

    #[tokio::test]
    async fn test_execute_dispatches_on_task_kind() {
        let train = envelope(TaskRequest::Train {
            dataset: "d".into(),
            model: "m".into(),
            hyperparams: BTreeMap::new(),
            parameters: Arc::new(vec![1.0, 2.0]),
        });
        match execute(&Echo, train).await.unwrap() {
            TaskPayload::Model(update) => {
                assert_eq!(update.delta, vec![1.0, 2.0]);
                assert_eq!(update.num_samples, 3);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let benchmark = envelope(TaskRequest::Benchmark {
            dataset: "d".into(),
            model: "m".into(),
        });
        assert!(matches!(
            execute(&Echo, benchmark).await.unwrap(),
            TaskPayload::Metrics(_)
        ));

        let validate = envelope(TaskRequest::Validate {
            dataset: "d".into(),
            model: "m".into(),
            parameters: Arc::new(vec![]),
        });
        assert_eq!(
            execute(&Echo, validate).await.unwrap_err(),
            TaskFailure("no validation data".to_string())
        );
    }

    #[test]
    fn test_envelope_json_is_tagged() {
        let json = serde_json::to_value(envelope(TaskRequest::Benchmark {
            dataset: "d".into(),
            model: "m".into(),
        }))
        .unwrap();
        assert_eq!(json["request"]["task"], "benchmark");
        assert_eq!(json["attempt"], 1);
    }
}
