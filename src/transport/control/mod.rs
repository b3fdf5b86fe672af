//! The control channel: registrations and heartbeats, published by clients
//! and consumed by the coordinator.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    common::{Capabilities, ClientId, Endpoint},
    registry::{RegistryError, RegistryHandle},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register {
        client_id: ClientId,
        endpoint: Endpoint,
        #[serde(default)]
        capabilities: Capabilities,
    },
    Heartbeat {
        client_id: ClientId,
        timestamp: DateTime<Utc>,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        serde_json::to_vec(self).map_err(ControlError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        serde_json::from_slice(bytes).map_err(ControlError::Decode)
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            ControlMessage::Register { client_id, .. } => *client_id,
            ControlMessage::Heartbeat { client_id, .. } => *client_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("could not encode control message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid control message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("control channel closed")]
    Closed,
}

/// The receiving end of the control channel.
#[async_trait]
pub trait ControlSubscriber: Send {
    /// The next message, or `None` once the channel is closed for good. A
    /// message that could not be decoded is returned as an error and does not
    /// end the stream.
    async fn next_message(&mut self) -> Option<Result<ControlMessage, ControlError>>;
}

/// The sending end of the control channel.
#[async_trait]
pub trait ControlPublisher: Send + Sync {
    async fn publish(&self, message: &ControlMessage) -> Result<(), ControlError>;
}

/// Feed control messages into the registry until the channel or the registry
/// goes away.
pub async fn listen<S: ControlSubscriber>(mut subscriber: S, registry: RegistryHandle) {
    while let Some(message) = subscriber.next_message().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping control message: {}", e);
                continue;
            }
        };
        trace!("control message from client {}", message.client_id());

        let result = match message {
            ControlMessage::Register {
                client_id,
                endpoint,
                capabilities,
            } => registry.register(client_id, endpoint, capabilities).await,
            ControlMessage::Heartbeat {
                client_id,
                timestamp,
            } => registry.heartbeat(client_id, timestamp).await.map(|_| ()),
        };
        match result {
            // rejected registrations are logged by the registry
            Ok(()) | Err(RegistryError::Registration(_)) => {}
            Err(RegistryError::ShutDown) => {
                warn!("control listener stopped: registry is gone");
                return;
            }
        }
    }
    info!("control channel closed");
}
