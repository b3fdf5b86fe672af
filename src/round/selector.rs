use rand::{seq::index, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::registry::Client;

/// How the participants of a round are drawn from the eligible clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Every eligible client takes part.
    All,
    /// `count` clients drawn uniformly without replacement. With a seed the
    /// draw for a given round is reproducible.
    Uniform { count: usize, seed: Option<u64> },
}

impl SamplingPolicy {
    pub fn selector(&self) -> Box<dyn Selector> {
        match *self {
            SamplingPolicy::All => Box::new(AllSelector),
            SamplingPolicy::Uniform { count, seed } => Box::new(UniformSelector { count, seed }),
        }
    }
}

/// Picks the participants of a round out of the eligible clients, which are
/// given in registration order.
pub trait Selector: Send + Sync {
    fn select(&self, round: u32, eligible: Vec<Client>) -> Vec<Client>;
}

pub struct AllSelector;

impl Selector for AllSelector {
    fn select(&self, _round: u32, eligible: Vec<Client>) -> Vec<Client> {
        eligible
    }
}

pub struct UniformSelector {
    count: usize,
    seed: Option<u64>,
}

impl UniformSelector {
    pub fn new(count: usize, seed: Option<u64>) -> Self {
        Self { count, seed }
    }

    fn rng(&self, round: u32) -> ChaCha20Rng {
        match self.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed.wrapping_add(round as u64)),
            None => ChaCha20Rng::from_entropy(),
        }
    }
}

impl Selector for UniformSelector {
    fn select(&self, round: u32, eligible: Vec<Client>) -> Vec<Client> {
        if eligible.len() <= self.count {
            return eligible;
        }
        let mut picked = index::sample(&mut self.rng(round), eligible.len(), self.count).into_vec();
        // report the sample in registration order
        picked.sort_unstable();

        let mut eligible: Vec<Option<Client>> = eligible.into_iter().map(Some).collect();
        picked
            .into_iter()
            .filter_map(|i| eligible[i].take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Capabilities, ClientId, Endpoint},
        registry::ClientStatus,
    };
    use chrono::Utc;

    fn clients(n: u16) -> Vec<Client> {
        (0..n)
            .map(|i| Client {
                id: ClientId::new(),
                endpoint: Endpoint::new("127.0.0.1", 9000 + i),
                capabilities: Capabilities::default(),
                registered_at: Utc::now(),
                last_heartbeat: Utc::now(),
                status: ClientStatus::Registered,
            })
            .collect()
    }

    fn ids(clients: &[Client]) -> Vec<ClientId> {
        clients.iter().map(|c| c.id).collect()
    }

    #[test]
    fn all_keeps_everyone_in_order() {
        let eligible = clients(4);
        let expected = ids(&eligible);
        assert_eq!(ids(&AllSelector.select(0, eligible)), expected);
    }

    #[test]
    fn uniform_is_reproducible_with_a_seed() {
        let eligible = clients(10);
        let selector = UniformSelector::new(4, Some(42));

        let first = ids(&selector.select(3, eligible.clone()));
        let second = ids(&selector.select(3, eligible.clone()));
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);

        // sampled clients keep their registration order
        let positions: Vec<usize> = first
            .iter()
            .map(|id| eligible.iter().position(|c| c.id == *id).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn uniform_never_duplicates() {
        let eligible = clients(6);
        let mut picked = ids(&UniformSelector::new(5, None).select(0, eligible));
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 5);
    }

    #[test]
    fn uniform_with_fewer_eligible_takes_all() {
        let eligible = clients(2);
        let expected = ids(&eligible);
        assert_eq!(
            ids(&UniformSelector::new(5, Some(1)).select(0, eligible)),
            expected
        );
    }

    #[test]
    fn policy_from_toml_shape() {
        let policy: SamplingPolicy =
            serde_json::from_str(r#"{"policy": "uniform", "count": 3, "seed": 7}"#).unwrap();
        assert_eq!(
            policy,
            SamplingPolicy::Uniform {
                count: 3,
                seed: Some(7)
            }
        );
        let policy: SamplingPolicy = serde_json::from_str(r#"{"policy": "all"}"#).unwrap();
        assert_eq!(policy, SamplingPolicy::All);
    }
}
