//! The control channel over Redis pub/sub.
//!
//! Pub/sub messages are never stored by Redis: a client publishing while the
//! coordinator is down is lost. Clients therefore re-register periodically.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Msg};

use super::{ControlError, ControlMessage, ControlPublisher, ControlSubscriber};

pub struct RedisSubscriber {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

impl RedisSubscriber {
    pub async fn connect(url: &str, channel: &str) -> Result<Self, ControlError> {
        let client = Client::open(url)?;
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;
        info!("subscribed to control channel `{}`", channel);
        Ok(Self {
            messages: Box::pin(pubsub.into_on_message()),
        })
    }
}

#[async_trait]
impl ControlSubscriber for RedisSubscriber {
    async fn next_message(&mut self) -> Option<Result<ControlMessage, ControlError>> {
        let msg = self.messages.next().await?;
        Some(ControlMessage::decode(msg.get_payload_bytes()))
    }
}

#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
    channel: String,
}

impl RedisPublisher {
    pub async fn connect(url: &str, channel: &str) -> Result<Self, ControlError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            connection,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl ControlPublisher for RedisPublisher {
    async fn publish(&self, message: &ControlMessage) -> Result<(), ControlError> {
        let payload = message.encode()?;
        let mut connection = self.connection.clone();
        let _: () = connection.publish(&self.channel, payload).await?;
        Ok(())
    }
}
