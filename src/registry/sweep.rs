use std::time::Duration;

use chrono::Utc;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::RegistryHandle;

/// Periodically marks clients that stopped sending heartbeats as unreachable.
pub struct HeartbeatSweeper {
    registry: RegistryHandle,
    interval: Duration,
}

/// Stops the sweep task it belongs to.
pub struct SweeperHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatSweeper {
    pub fn new(registry: RegistryHandle, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticks = interval(self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("heartbeat sweeper stopped");
                    return;
                }
                _ = ticks.tick() => {
                    match self.registry.sweep(Utc::now()).await {
                        Ok(expired) if !expired.is_empty() => {
                            info!("{} client(s) missed their heartbeat deadline", expired.len());
                        }
                        Ok(_) => trace!("heartbeat sweep: all clients alive"),
                        Err(_) => {
                            warn!("heartbeat sweeper stopped: registry is gone");
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!("heartbeat sweeper task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::{Capabilities, ClientId, Endpoint},
        registry::{ClientStatus, RegistryService},
    };

    #[tokio::test]
    async fn test_sweeper_marks_silent_clients() {
        // a zero timeout expires every client at the next sweep
        let (service, registry) = RegistryService::new(Duration::ZERO);
        tokio::spawn(service.run());
        let a = ClientId::new();
        registry
            .register(a, Endpoint::new("h", 1), Capabilities::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let sweeper = HeartbeatSweeper::new(registry.clone(), Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.shutdown().await;

        assert_eq!(registry.status(a).await.unwrap(), ClientStatus::Unreachable);
    }
}
