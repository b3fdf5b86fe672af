use anyhow::anyhow;
use async_trait::async_trait;

use super::ArtifactValidator;
use crate::common::{GlobalArtifact, Metrics};

/// Summary statistics of the model parameters: `mean`, `l2_norm` and
/// `max_abs`. Fails on NaN or infinite parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParameterStatistics;

#[async_trait]
impl ArtifactValidator for ParameterStatistics {
    async fn validate(&self, artifact: &GlobalArtifact) -> Result<Metrics, anyhow::Error> {
        let parameters = artifact.parameters();
        if let Some(position) = parameters.iter().position(|p| !p.is_finite()) {
            return Err(anyhow!("parameter {} is not finite", position));
        }

        let (sum, squares, max_abs) = parameters.iter().fold(
            (0.0_f64, 0.0_f64, 0.0_f64),
            |(sum, squares, max_abs), p| {
                let p = *p as f64;
                (sum + p, squares + p * p, max_abs.max(p.abs()))
            },
        );
        let mean = if parameters.is_empty() {
            0.0
        } else {
            sum / parameters.len() as f64
        };
        Ok(vec![
            ("mean".to_string(), mean),
            ("l2_norm".to_string(), squares.sqrt()),
            ("max_abs".to_string(), max_abs),
        ]
        .into_iter()
        .collect())
    }
}
