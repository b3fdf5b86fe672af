//! Broadcasting of the session state to observers such as the REST API.

use std::sync::Arc;

use tokio::sync::watch;

use super::{RoundSummary, SessionStatus};
use crate::common::GlobalArtifact;

/// Publishes session updates. Owned by the [`SessionManager`].
///
/// [`SessionManager`]: super::SessionManager
#[derive(Debug)]
pub struct EventPublisher {
    status_tx: watch::Sender<SessionStatus>,
    model_tx: watch::Sender<Arc<GlobalArtifact>>,
    history_tx: watch::Sender<Arc<Vec<RoundSummary>>>,
}

/// Observes the latest session updates. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    status_rx: watch::Receiver<SessionStatus>,
    model_rx: watch::Receiver<Arc<GlobalArtifact>>,
    history_rx: watch::Receiver<Arc<Vec<RoundSummary>>>,
}

impl EventPublisher {
    pub fn init(status: SessionStatus, model: Arc<GlobalArtifact>) -> (Self, EventSubscriber) {
        let (status_tx, status_rx) = watch::channel(status);
        let (model_tx, model_rx) = watch::channel(model);
        let (history_tx, history_rx) = watch::channel(Arc::new(Vec::new()));
        (
            Self {
                status_tx,
                model_tx,
                history_tx,
            },
            EventSubscriber {
                status_rx,
                model_rx,
                history_rx,
            },
        )
    }

    pub fn broadcast_status(&self, status: SessionStatus) {
        // sending only fails without subscribers, which is fine
        let _ = self.status_tx.send(status);
    }

    pub fn broadcast_model(&self, model: Arc<GlobalArtifact>) {
        let _ = self.model_tx.send(model);
    }

    pub fn broadcast_history(&self, history: Arc<Vec<RoundSummary>>) {
        let _ = self.history_tx.send(history);
    }
}

impl EventSubscriber {
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn model(&self) -> Arc<GlobalArtifact> {
        self.model_rx.borrow().clone()
    }

    pub fn history(&self) -> Arc<Vec<RoundSummary>> {
        self.history_rx.borrow().clone()
    }
}
