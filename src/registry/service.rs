use std::time::Duration;

use chrono::{DateTime, Utc};
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use super::{Client, ClientRegistry, ClientStatus, RegistrationError};
use crate::common::{Capabilities, ClientId, Endpoint};

/// Errors returned by the [`RegistryHandle`].
#[derive(Debug, Display, Error)]
pub enum RegistryError {
    /// The registry service has shut down.
    ShutDown,
    /// The registration was rejected: {0}.
    Registration(#[from] RegistrationError),
}

enum Request {
    Register {
        id: ClientId,
        endpoint: Endpoint,
        capabilities: Capabilities,
        response_tx: oneshot::Sender<Result<(), RegistrationError>>,
    },
    Heartbeat {
        id: ClientId,
        timestamp: DateTime<Utc>,
        response_tx: oneshot::Sender<bool>,
    },
    MarkUnreachable {
        id: ClientId,
    },
    Sweep {
        now: DateTime<Utc>,
        response_tx: oneshot::Sender<Vec<ClientId>>,
    },
    ListEligible {
        required: Capabilities,
        response_tx: oneshot::Sender<Vec<Client>>,
    },
    MarkBusy {
        ids: Vec<ClientId>,
        response_tx: oneshot::Sender<Vec<ClientId>>,
    },
    Release {
        ids: Vec<ClientId>,
    },
    Status {
        id: ClientId,
        response_tx: oneshot::Sender<ClientStatus>,
    },
    Snapshot {
        response_tx: oneshot::Sender<Vec<Client>>,
    },
}

/// The task owning the [`ClientRegistry`]. Requests are served one at a time
/// in arrival order until every handle has been dropped.
pub struct RegistryService {
    registry: ClientRegistry,
    heartbeat_timeout: Duration,
    requests: UnboundedReceiver<Request>,
}

impl RegistryService {
    pub fn new(heartbeat_timeout: Duration) -> (Self, RegistryHandle) {
        let (tx, rx) = unbounded_channel();
        let service = Self {
            registry: ClientRegistry::new(),
            heartbeat_timeout,
            requests: rx,
        };
        (service, RegistryHandle { requests: tx })
    }

    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }
        debug!("registry service stopped: all handles dropped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Register {
                id,
                endpoint,
                capabilities,
                response_tx,
            } => {
                let result = self
                    .registry
                    .register(id, endpoint, capabilities, Utc::now());
                if let Err(ref e) = result {
                    warn!("rejected registration of client {}: {}", id, e);
                }
                let _ = response_tx.send(result);
            }
            Request::Heartbeat {
                id,
                timestamp,
                response_tx,
            } => {
                let _ = response_tx.send(self.registry.heartbeat(id, timestamp, Utc::now()));
            }
            Request::MarkUnreachable { id } => self.registry.mark_unreachable(id),
            Request::Sweep { now, response_tx } => {
                let expired = self.registry.sweep(now, self.heartbeat_timeout);
                let _ = response_tx.send(expired);
            }
            Request::ListEligible {
                required,
                response_tx,
            } => {
                let _ = response_tx.send(self.registry.list_eligible(&required));
            }
            Request::MarkBusy { ids, response_tx } => {
                let marked = ids
                    .into_iter()
                    .filter(|id| self.registry.mark_busy(*id))
                    .collect();
                let _ = response_tx.send(marked);
            }
            Request::Release { ids } => {
                for id in ids {
                    self.registry.release(id);
                }
            }
            Request::Status { id, response_tx } => {
                let _ = response_tx.send(self.registry.status(&id));
            }
            Request::Snapshot { response_tx } => {
                let _ = response_tx.send(self.registry.iter().cloned().collect());
            }
        }
    }
}

/// A cloneable handle to the [`RegistryService`].
#[derive(Clone)]
pub struct RegistryHandle {
    requests: UnboundedSender<Request>,
}

impl RegistryHandle {
    pub async fn register(
        &self,
        id: ClientId,
        endpoint: Endpoint,
        capabilities: Capabilities,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Register {
            id,
            endpoint,
            capabilities,
            response_tx: tx,
        })?;
        Ok(Self::recv(rx).await??)
    }

    /// Returns whether the heartbeat was applied. `timestamp` is the send time
    /// reported by the client; liveness is tracked with the receive time.
    pub async fn heartbeat(
        &self,
        id: ClientId,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Heartbeat {
            id,
            timestamp,
            response_tx: tx,
        })?;
        Self::recv(rx).await
    }

    pub fn mark_unreachable(&self, id: ClientId) -> Result<(), RegistryError> {
        self.send(Request::MarkUnreachable { id })
    }

    /// Mark clients without a recent heartbeat as unreachable, returning them.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<ClientId>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Sweep {
            now,
            response_tx: tx,
        })?;
        Self::recv(rx).await
    }

    pub async fn list_eligible(
        &self,
        required: Capabilities,
    ) -> Result<Vec<Client>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::ListEligible {
            required,
            response_tx: tx,
        })?;
        Self::recv(rx).await
    }

    /// Mark the given clients busy, returning the ones that could be marked.
    pub async fn mark_busy(&self, ids: Vec<ClientId>) -> Result<Vec<ClientId>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::MarkBusy {
            ids,
            response_tx: tx,
        })?;
        Self::recv(rx).await
    }

    pub fn release(&self, ids: Vec<ClientId>) -> Result<(), RegistryError> {
        self.send(Request::Release { ids })
    }

    pub async fn status(&self, id: ClientId) -> Result<ClientStatus, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Status {
            id,
            response_tx: tx,
        })?;
        Self::recv(rx).await
    }

    /// All known clients in registration order.
    pub async fn snapshot(&self) -> Result<Vec<Client>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Snapshot { response_tx: tx })?;
        Self::recv(rx).await
    }

    fn send(&self, request: Request) -> Result<(), RegistryError> {
        self.requests.send(request).map_err(|_| {
            warn!("failed to send request: registry service is gone");
            RegistryError::ShutDown
        })
    }

    async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T, RegistryError> {
        rx.await.map_err(|_| {
            warn!("could not receive response: channel closed");
            RegistryError::ShutDown
        })
    }
}
