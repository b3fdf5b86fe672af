use std::{collections::BTreeMap, sync::Arc};

/// Named scalar metrics, ordered by name so that reports are stable.
pub type Metrics = BTreeMap<String, f64>;

/// The global model held by the session.
///
/// `version` is the index of the round that produced the parameters, or
/// `None` for the initial model. The parameters are shared so handing them to
/// every dispatched task is cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalArtifact {
    version: Option<u32>,
    parameters: Arc<Vec<f32>>,
}

impl GlobalArtifact {
    pub fn initial(parameters: Vec<f32>) -> Self {
        Self {
            version: None,
            parameters: Arc::new(parameters),
        }
    }

    /// An initial model of `size` zero weights.
    pub fn zeros(size: usize) -> Self {
        Self::initial(vec![0.0; size])
    }

    /// A new artifact produced by `round`.
    pub fn produce(round: u32, parameters: Vec<f32>) -> Self {
        Self {
            version: Some(round),
            parameters: Arc::new(parameters),
        }
    }

    /// The same parameters, re-tagged as the output of `round`. Used by
    /// rounds that do not change the model.
    pub fn carry_forward(&self, round: u32) -> Self {
        Self {
            version: Some(round),
            parameters: self.parameters.clone(),
        }
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    pub fn parameters(&self) -> &[f32] {
        &self.parameters
    }

    pub fn shared_parameters(&self) -> Arc<Vec<f32>> {
        self.parameters.clone()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_forward_shares_parameters() {
        let initial = GlobalArtifact::initial(vec![1.0, 2.0]);
        assert_eq!(initial.version(), None);

        let next = initial.carry_forward(3);
        assert_eq!(next.version(), Some(3));
        assert!(Arc::ptr_eq(
            &initial.shared_parameters(),
            &next.shared_parameters()
        ));
    }

    #[test]
    fn bytes() {
        let artifact = GlobalArtifact::produce(2, vec![0.5, -0.25, 4.0]);
        let bytes = artifact.to_bytes().unwrap();
        assert_eq!(GlobalArtifact::from_bytes(&bytes).unwrap(), artifact);
    }
}
