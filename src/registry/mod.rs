//! Client membership and liveness.
//!
//! [`ClientRegistry`] is the plain state. It is owned by a [`RegistryService`]
//! task and mutated only through a [`RegistryHandle`], so every registration,
//! heartbeat and sweep is applied in the order it was received.

mod service;
mod sweep;

pub use self::{
    service::{RegistryError, RegistryHandle, RegistryService},
    sweep::{HeartbeatSweeper, SweeperHandle},
};

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::common::{Capabilities, ClientId, Endpoint};

/// Clock differences beyond this many seconds are logged.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Unknown,
    Registered,
    Busy,
    Unreachable,
}

/// A client as seen by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: ClientId,
    pub endpoint: Endpoint,
    pub capabilities: Capabilities,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ClientStatus,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("malformed endpoint `{0}`")]
    InvalidEndpoint(Endpoint),
    #[error("endpoint `{endpoint}` is already claimed by client {owner}")]
    EndpointConflict { endpoint: Endpoint, owner: ClientId },
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
    /// Client ids in order of first registration.
    order: Vec<ClientId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, or refresh an existing registration.
    ///
    /// A known client gets its endpoint and capabilities replaced and becomes
    /// REGISTERED again, but keeps its original registration position and time.
    pub fn register(
        &mut self,
        id: ClientId,
        endpoint: Endpoint,
        capabilities: Capabilities,
        now: DateTime<Utc>,
    ) -> Result<(), RegistrationError> {
        if !endpoint.is_valid() {
            return Err(RegistrationError::InvalidEndpoint(endpoint));
        }
        if let Some(owner) = self.endpoint_owner(&endpoint, id) {
            return Err(RegistrationError::EndpointConflict { endpoint, owner });
        }

        match self.clients.get_mut(&id) {
            Some(client) => {
                debug!("client {} re-registered at {}", id, endpoint);
                client.endpoint = endpoint;
                client.capabilities = capabilities;
                client.last_heartbeat = client.last_heartbeat.max(now);
                client.status = ClientStatus::Registered;
            }
            None => {
                info!("client {} registered at {}", id, endpoint);
                self.clients.insert(
                    id,
                    Client {
                        id,
                        endpoint,
                        capabilities,
                        registered_at: now,
                        last_heartbeat: now,
                        status: ClientStatus::Registered,
                    },
                );
                self.order.push(id);
            }
        }
        Ok(())
    }

    fn endpoint_owner(&self, endpoint: &Endpoint, id: ClientId) -> Option<ClientId> {
        self.clients
            .values()
            .find(|c| c.id != id && c.status != ClientStatus::Unreachable && &c.endpoint == endpoint)
            .map(|c| c.id)
    }

    /// Record a heartbeat sent at `sent_at` by the client and received at
    /// `received_at` by the coordinator. Returns `false` if the heartbeat was
    /// not applied because the client is unknown or unreachable.
    ///
    /// Liveness follows the receive time only. The client clock is not
    /// trusted: a skewed `sent_at` is logged and otherwise ignored.
    pub fn heartbeat(
        &mut self,
        id: ClientId,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> bool {
        match self.clients.get_mut(&id) {
            None => {
                warn!("heartbeat from unknown client {}", id);
                false
            }
            Some(client) if client.status == ClientStatus::Unreachable => {
                debug!("ignoring heartbeat from unreachable client {}", id);
                false
            }
            Some(client) => {
                let skew = sent_at.signed_duration_since(received_at).num_seconds();
                if skew.abs() > MAX_CLOCK_SKEW_SECS {
                    debug!("clock of client {} is {}s off", id, skew);
                }
                // out of order heartbeats never move the clock back
                client.last_heartbeat = client.last_heartbeat.max(received_at);
                true
            }
        }
    }

    pub fn mark_unreachable(&mut self, id: ClientId) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.status != ClientStatus::Unreachable {
                info!("client {} marked unreachable", id);
                client.status = ClientStatus::Unreachable;
            }
        }
    }

    /// Mark every live client whose last heartbeat is older than `timeout`
    /// as unreachable, and return their ids.
    pub fn sweep(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ClientId> {
        let expired: Vec<ClientId> = self
            .order
            .iter()
            .filter_map(|id| self.clients.get(id))
            .filter(|c| matches!(c.status, ClientStatus::Registered | ClientStatus::Busy))
            .filter(|c| {
                now.signed_duration_since(c.last_heartbeat)
                    .to_std()
                    .map(|elapsed| elapsed > timeout)
                    .unwrap_or(false)
            })
            .map(|c| c.id)
            .collect();
        for id in expired.iter() {
            self.mark_unreachable(*id);
        }
        expired
    }

    /// REGISTERED clients whose capabilities cover `required`, in
    /// registration order.
    pub fn list_eligible(&self, required: &Capabilities) -> Vec<Client> {
        self.iter()
            .filter(|c| c.status == ClientStatus::Registered && c.capabilities.satisfies(required))
            .cloned()
            .collect()
    }

    /// Mark a client as taking part in a round. Only registered clients can
    /// become busy.
    pub fn mark_busy(&mut self, id: ClientId) -> bool {
        match self.clients.get_mut(&id) {
            Some(client) if client.status == ClientStatus::Registered => {
                client.status = ClientStatus::Busy;
                true
            }
            _ => false,
        }
    }

    /// Return a busy client to the pool. A client that went unreachable
    /// meanwhile stays unreachable.
    pub fn release(&mut self, id: ClientId) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.status == ClientStatus::Busy {
                client.status = ClientStatus::Registered;
            }
        }
    }

    pub fn status(&self, id: &ClientId) -> ClientStatus {
        self.clients
            .get(id)
            .map(|c| c.status)
            .unwrap_or(ClientStatus::Unknown)
    }

    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All clients in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.order.iter().filter_map(move |id| self.clients.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn caps(datasets: &[&str], models: &[&str]) -> Capabilities {
        Capabilities::new(datasets.iter().copied(), models.iter().copied())
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn test_list_eligible_superset_only() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let a = ClientId::new();
        let b = ClientId::new();
        let c = ClientId::new();
        registry
            .register(a, endpoint(1), caps(&["mnist", "cifar"], &["cnn"]), now)
            .unwrap();
        registry
            .register(b, endpoint(2), caps(&["cifar"], &["cnn"]), now)
            .unwrap();
        registry
            .register(c, endpoint(3), caps(&["mnist"], &["cnn", "mlp"]), now)
            .unwrap();
        registry.mark_unreachable(c);

        let eligible: Vec<ClientId> = registry
            .list_eligible(&caps(&["mnist"], &["cnn"]))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(eligible, vec![a]);

        let all: Vec<ClientId> = registry
            .list_eligible(&Capabilities::default())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(all, vec![a, b]);
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let a = ClientId::new();
        let b = ClientId::new();
        registry.register(a, endpoint(1), caps(&["x"], &[]), now).unwrap();
        registry.register(b, endpoint(2), caps(&["x"], &[]), now).unwrap();
        registry.mark_unreachable(a);

        registry
            .register(a, endpoint(5), caps(&["y"], &[]), now + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.status(&a), ClientStatus::Registered);
        assert_eq!(registry.get(&a).unwrap().endpoint, endpoint(5));
        assert_eq!(registry.get(&a).unwrap().registered_at, now);

        // original registration position is kept
        let order: Vec<ClientId> = registry.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn test_invalid_registrations() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let a = ClientId::new();
        let b = ClientId::new();

        assert_eq!(
            registry.register(a, Endpoint::new("", 1), Capabilities::default(), now),
            Err(RegistrationError::InvalidEndpoint(Endpoint::new("", 1)))
        );
        registry
            .register(a, endpoint(1), Capabilities::default(), now)
            .unwrap();
        assert_eq!(
            registry.register(b, endpoint(1), Capabilities::default(), now),
            Err(RegistrationError::EndpointConflict {
                endpoint: endpoint(1),
                owner: a
            })
        );
        assert_eq!(registry.len(), 1);

        // the endpoint of an unreachable client can be taken over
        registry.mark_unreachable(a);
        registry
            .register(b, endpoint(1), Capabilities::default(), now)
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_heartbeat() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let a = ClientId::new();
        assert!(!registry.heartbeat(a, now, now));
        assert_eq!(registry.status(&a), ClientStatus::Unknown);

        registry
            .register(a, endpoint(1), Capabilities::default(), now)
            .unwrap();
        let later = now + ChronoDuration::seconds(10);
        assert!(registry.heartbeat(a, later, later));
        // a duplicate handled late never moves the clock back
        let earlier = now + ChronoDuration::seconds(5);
        assert!(registry.heartbeat(a, earlier, earlier));
        assert_eq!(registry.get(&a).unwrap().last_heartbeat, later);

        registry.mark_unreachable(a);
        let last = later + ChronoDuration::seconds(1);
        assert!(!registry.heartbeat(a, last, last));
        assert_eq!(registry.status(&a), ClientStatus::Unreachable);
    }

    #[test]
    fn test_sweep() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let a = ClientId::new();
        let b = ClientId::new();
        let c = ClientId::new();
        registry.register(a, endpoint(1), Capabilities::default(), now).unwrap();
        registry.register(b, endpoint(2), Capabilities::default(), now).unwrap();
        registry.register(c, endpoint(3), Capabilities::default(), now).unwrap();
        assert!(registry.mark_busy(c));
        let beat = now + ChronoDuration::seconds(20);
        registry.heartbeat(b, beat, beat);

        let expired = registry.sweep(now + ChronoDuration::seconds(31), Duration::from_secs(30));
        assert_eq!(expired, vec![a, c]);
        assert_eq!(registry.status(&a), ClientStatus::Unreachable);
        assert_eq!(registry.status(&b), ClientStatus::Registered);
        assert_eq!(registry.status(&c), ClientStatus::Unreachable);

        // releasing an unreachable client keeps it unreachable
        registry.release(c);
        assert_eq!(registry.status(&c), ClientStatus::Unreachable);
        assert!(registry
            .sweep(now + ChronoDuration::seconds(40), Duration::from_secs(30))
            .is_empty());
    }

    #[test]
    fn test_sweep_ignores_client_clock() {
        let mut registry = ClientRegistry::new();
        let now = Utc::now();
        let ahead = ClientId::new();
        let behind = ClientId::new();
        registry
            .register(ahead, endpoint(1), Capabilities::default(), now)
            .unwrap();
        registry
            .register(behind, endpoint(2), Capabilities::default(), now)
            .unwrap();

        // a clock a day ahead does not keep a silent client alive
        assert!(registry.heartbeat(ahead, now + ChronoDuration::days(1), now));
        assert_eq!(registry.get(&ahead).unwrap().last_heartbeat, now);
        // a clock a day behind does not get a live client swept
        let received = now + ChronoDuration::seconds(20);
        assert!(registry.heartbeat(behind, now - ChronoDuration::days(1), received));

        let expired = registry.sweep(now + ChronoDuration::seconds(31), Duration::from_secs(30));
        assert_eq!(expired, vec![ahead]);
        assert_eq!(registry.status(&ahead), ClientStatus::Unreachable);
        assert_eq!(registry.status(&behind), ClientStatus::Registered);

        let expired = registry.sweep(now + ChronoDuration::hours(12), Duration::from_secs(30));
        assert_eq!(expired, vec![behind]);
    }

    #[test]
    fn test_busy_clients_are_not_eligible() {
        let mut registry = ClientRegistry::new();
        let a = ClientId::new();
        registry
            .register(a, endpoint(1), Capabilities::default(), Utc::now())
            .unwrap();
        assert!(registry.mark_busy(a));
        assert!(!registry.mark_busy(a));
        assert!(registry.list_eligible(&Capabilities::default()).is_empty());
        registry.release(a);
        assert_eq!(registry.list_eligible(&Capabilities::default()).len(), 1);
    }
}
