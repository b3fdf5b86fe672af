//! Reduction of the results of a round into a new global artifact.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    common::{ClientId, GlobalArtifact, Metrics},
    round::{RoundIndex, TaskResult},
    transport::{TaskKind, TaskPayload},
};

/// Why a result was left out of the aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The delta does not have as many parameters as the model.
    DimensionMismatch { expected: usize, actual: usize },
    /// The payload contains NaN or infinite values.
    NonFinite,
    /// The client reported zero samples.
    NoSamples,
    /// A model update for a metric round, or metrics for a training round.
    UnexpectedPayload,
    MissingPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// What went into an aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    /// The clients whose results were aggregated, in aggregation order.
    pub aggregated: Vec<ClientId>,
    /// Saturates at `u64::MAX`.
    pub total_samples: u64,
    pub excluded: Vec<Exclusion>,
    /// Sample-weighted means of the metrics reported by the clients.
    pub metrics: Metrics,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub artifact: GlobalArtifact,
    pub report: AggregationReport,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no valid results ({} excluded)", .excluded.len())]
    NoValidResults { excluded: Vec<Exclusion> },
}

/// Folds the successful results of a round into a new artifact.
///
/// Implementations must be deterministic: the same prior and the same results
/// in the same order always produce the same artifact.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        round: RoundIndex,
        kind: TaskKind,
        prior: &GlobalArtifact,
        results: &[TaskResult],
    ) -> Result<Aggregation, AggregationError>;
}

/// Federated averaging of model deltas, weighted by the number of samples
/// each client trained on.
#[derive(Debug, Default, Clone, Copy)]
pub struct FederatedAveraging;

impl FederatedAveraging {
    fn check<'a>(
        kind: TaskKind,
        prior: &GlobalArtifact,
        payload: Option<&'a TaskPayload>,
    ) -> Result<&'a TaskPayload, ExclusionReason> {
        let payload = payload.ok_or(ExclusionReason::MissingPayload)?;
        match (kind.produces_model(), payload) {
            (true, TaskPayload::Model(update)) => {
                if update.delta.len() != prior.len() {
                    return Err(ExclusionReason::DimensionMismatch {
                        expected: prior.len(),
                        actual: update.delta.len(),
                    });
                }
                if !update.delta.iter().all(|x| x.is_finite())
                    || !update.metrics.values().all(|x| x.is_finite())
                {
                    return Err(ExclusionReason::NonFinite);
                }
            }
            (false, TaskPayload::Metrics(report)) => {
                if !report.metrics.values().all(|x| x.is_finite()) {
                    return Err(ExclusionReason::NonFinite);
                }
            }
            _ => return Err(ExclusionReason::UnexpectedPayload),
        }
        if payload.num_samples() == 0 {
            return Err(ExclusionReason::NoSamples);
        }
        Ok(payload)
    }
}

impl Aggregator for FederatedAveraging {
    fn aggregate(
        &self,
        round: RoundIndex,
        kind: TaskKind,
        prior: &GlobalArtifact,
        results: &[TaskResult],
    ) -> Result<Aggregation, AggregationError> {
        let mut valid = Vec::with_capacity(results.len());
        let mut excluded = Vec::new();
        for result in results {
            match Self::check(kind, prior, result.payload.as_ref()) {
                Ok(payload) => valid.push((result.client_id, payload)),
                Err(reason) => {
                    warn!("excluding result of client {}: {:?}", result.client_id, reason);
                    excluded.push(Exclusion {
                        client_id: result.client_id,
                        reason,
                    });
                }
            }
        }
        if valid.is_empty() {
            return Err(AggregationError::NoValidResults { excluded });
        }

        // sample counts are reported by clients and may add up past u64::MAX
        let total_samples = valid
            .iter()
            .fold(0_u64, |total, (_, p)| total.saturating_add(p.num_samples()));
        let total: f64 = valid.iter().map(|(_, p)| p.num_samples() as f64).sum();

        let mut sums: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        let mut acc = vec![0.0_f64; prior.len()];
        for (_, payload) in valid.iter() {
            let samples = payload.num_samples() as f64;
            let metrics = match payload {
                TaskPayload::Model(update) => {
                    let weight = samples / total;
                    for (a, d) in acc.iter_mut().zip(update.delta.iter()) {
                        *a += weight * *d as f64;
                    }
                    &update.metrics
                }
                TaskPayload::Metrics(report) => &report.metrics,
            };
            for (name, value) in metrics.iter() {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0.0));
                entry.0 += samples * value;
                entry.1 += samples;
            }
        }

        let metrics: Metrics = sums
            .into_iter()
            .map(|(name, (sum, weight))| (name.to_string(), sum / weight))
            .collect();

        let artifact = if kind.produces_model() {
            let parameters = prior
                .parameters()
                .iter()
                .zip(acc.iter())
                .map(|(p, a)| (*p as f64 + a) as f32)
                .collect();
            GlobalArtifact::produce(round, parameters)
        } else {
            prior.carry_forward(round)
        };

        debug!(
            "aggregated {} result(s) over {} sample(s), {} excluded",
            valid.len(),
            total_samples,
            excluded.len()
        );
        Ok(Aggregation {
            artifact,
            report: AggregationReport {
                aggregated: valid.iter().map(|(id, _)| *id).collect(),
                total_samples,
                excluded,
                metrics,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        round::TaskStatus,
        transport::{EvaluationReport, ModelUpdate},
    };

    fn train_result(delta: Vec<f32>, num_samples: u64, loss: f64) -> TaskResult {
        TaskResult {
            client_id: ClientId::new(),
            round: 1,
            kind: TaskKind::Train,
            status: TaskStatus::Succeeded,
            payload: Some(TaskPayload::Model(ModelUpdate {
                delta,
                num_samples,
                metrics: vec![("loss".to_string(), loss)].into_iter().collect(),
            })),
            error: None,
            attempts: 1,
        }
    }

    fn metric_result(accuracy: f64, num_samples: u64) -> TaskResult {
        TaskResult {
            client_id: ClientId::new(),
            round: 0,
            kind: TaskKind::Benchmark,
            status: TaskStatus::Succeeded,
            payload: Some(TaskPayload::Metrics(EvaluationReport {
                metrics: vec![("accuracy".to_string(), accuracy)].into_iter().collect(),
                num_samples,
            })),
            error: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_weighted_average_of_deltas() {
        let prior = GlobalArtifact::initial(vec![1.0, 1.0, 1.0]);
        let results = vec![
            train_result(vec![3.0, 1.0, 0.0], 1, 0.5),
            train_result(vec![0.0, 1.0, 3.0], 2, 0.2),
        ];
        let aggregation = FederatedAveraging
            .aggregate(1, TaskKind::Train, &prior, &results)
            .unwrap();
        assert_eq!(aggregation.artifact.version(), Some(1));
        assert_eq!(aggregation.artifact.parameters(), &[2.0, 2.0, 3.0]);
        assert_eq!(aggregation.report.total_samples, 3);
        assert!((aggregation.report.metrics["loss"] - 0.3).abs() < 1e-12);
        // the prior is untouched
        assert_eq!(prior.parameters(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let prior = GlobalArtifact::initial(vec![0.1, -0.2, 0.3, 0.7]);
        let results: Vec<TaskResult> = (1..8)
            .map(|i| {
                let x = i as f32 * 0.013;
                train_result(vec![x, -x, x * x, 1.0 / x], i * 7, x as f64)
            })
            .collect();
        let first = FederatedAveraging
            .aggregate(4, TaskKind::Train, &prior, &results)
            .unwrap();
        let second = FederatedAveraging
            .aggregate(4, TaskKind::Train, &prior, &results)
            .unwrap();
        assert_eq!(
            first.artifact.to_bytes().unwrap(),
            second.artifact.to_bytes().unwrap()
        );
        assert_eq!(first.report, second.report);
    }

    #[test]
    fn test_single_result() {
        let prior = GlobalArtifact::initial(vec![0.0, 0.0]);
        let results = vec![train_result(vec![0.5, -0.5], 10, 1.0)];
        let aggregation = FederatedAveraging
            .aggregate(0, TaskKind::Train, &prior, &results)
            .unwrap();
        assert_eq!(aggregation.artifact.parameters(), &[0.5, -0.5]);
        assert_eq!(aggregation.report.aggregated, vec![results[0].client_id]);
    }

    #[test]
    fn test_invalid_results_are_excluded() {
        let prior = GlobalArtifact::initial(vec![0.0, 0.0]);
        let results = vec![
            train_result(vec![1.0, 1.0], 1, 0.0),
            train_result(vec![1.0], 1, 0.0),
            train_result(vec![f32::NAN, 1.0], 1, 0.0),
            train_result(vec![1.0, 1.0], 0, 0.0),
            metric_result(0.9, 4),
        ];
        let aggregation = FederatedAveraging
            .aggregate(2, TaskKind::Train, &prior, &results)
            .unwrap();
        assert_eq!(aggregation.artifact.parameters(), &[1.0, 1.0]);
        let reasons: Vec<ExclusionReason> = aggregation
            .report
            .excluded
            .iter()
            .map(|e| e.reason.clone())
            .collect();
        assert_eq!(
            reasons,
            vec![
                ExclusionReason::DimensionMismatch {
                    expected: 2,
                    actual: 1
                },
                ExclusionReason::NonFinite,
                ExclusionReason::NoSamples,
                ExclusionReason::UnexpectedPayload,
            ]
        );
    }

    #[test]
    fn test_no_valid_results() {
        let prior = GlobalArtifact::initial(vec![0.0]);
        let results = vec![train_result(vec![1.0, 2.0], 3, 0.0)];
        let err = FederatedAveraging
            .aggregate(0, TaskKind::Train, &prior, &results)
            .unwrap_err();
        let AggregationError::NoValidResults { excluded } = err;
        assert_eq!(excluded.len(), 1);
    }

    #[test]
    fn test_huge_sample_counts() {
        let prior = GlobalArtifact::initial(vec![0.0, 0.0]);
        let results = vec![
            train_result(vec![1.0, 1.0], u64::MAX, 0.5),
            train_result(vec![3.0, 3.0], 2, 0.5),
            train_result(vec![1.0, 1.0], u64::MAX, 0.5),
        ];
        let aggregation = FederatedAveraging
            .aggregate(3, TaskKind::Train, &prior, &results)
            .unwrap();
        assert_eq!(aggregation.report.total_samples, u64::MAX);
        assert_eq!(aggregation.report.aggregated.len(), 3);
        for p in aggregation.artifact.parameters() {
            assert!((p - 1.0).abs() < 1e-6);
        }
        assert!((aggregation.report.metrics["loss"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_metric_round_keeps_parameters() {
        let prior = GlobalArtifact::initial(vec![4.0, 2.0]);
        let results = vec![metric_result(0.5, 1), metric_result(0.8, 3)];
        let aggregation = FederatedAveraging
            .aggregate(0, TaskKind::Benchmark, &prior, &results)
            .unwrap();
        assert_eq!(aggregation.artifact.version(), Some(0));
        assert_eq!(aggregation.artifact.parameters(), prior.parameters());
        assert!((aggregation.report.metrics["accuracy"] - 0.725).abs() < 1e-12);
    }
}
