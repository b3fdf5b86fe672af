//! An in-process control channel.

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{ControlError, ControlMessage, ControlPublisher, ControlSubscriber};

/// Create a connected publisher/subscriber pair. Messages go through the same
/// encoding as on the wire. The channel closes once every publisher is
/// dropped.
pub fn channel() -> (MemoryPublisher, MemorySubscriber) {
    let (tx, rx) = unbounded_channel();
    (MemoryPublisher(tx), MemorySubscriber(rx))
}

#[derive(Clone)]
pub struct MemoryPublisher(UnboundedSender<Vec<u8>>);

impl MemoryPublisher {
    /// Publish bytes as they are, without encoding them first.
    pub fn publish_raw(&self, bytes: Vec<u8>) -> Result<(), ControlError> {
        self.0.send(bytes).map_err(|_| ControlError::Closed)
    }
}

#[async_trait]
impl ControlPublisher for MemoryPublisher {
    async fn publish(&self, message: &ControlMessage) -> Result<(), ControlError> {
        self.publish_raw(message.encode()?)
    }
}

pub struct MemorySubscriber(UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl ControlSubscriber for MemorySubscriber {
    async fn next_message(&mut self) -> Option<Result<ControlMessage, ControlError>> {
        let bytes = self.0.recv().await?;
        Some(ControlMessage::decode(&bytes))
    }
}
