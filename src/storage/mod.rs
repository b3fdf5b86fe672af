//! Persistence of round boundaries.

mod file;

pub use self::file::FileStore;

use async_trait::async_trait;

use crate::{
    common::GlobalArtifact,
    session::{RoundSummary, SessionStatus},
};

/// The error type for storage operations that are not tied to a specific storage backend.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// Records the progress of a session. Called once per round boundary and per
/// status change; failures are reported but never stop the session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_round(&self, summary: &RoundSummary) -> StorageResult<()>;

    async fn save_artifact(&self, artifact: &GlobalArtifact) -> StorageResult<()>;

    async fn save_status(&self, status: &SessionStatus) -> StorageResult<()>;
}

/// A store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl SessionStore for NoopStore {
    async fn save_round(&self, _: &RoundSummary) -> StorageResult<()> {
        Ok(())
    }

    async fn save_artifact(&self, _: &GlobalArtifact) -> StorageResult<()> {
        Ok(())
    }

    async fn save_status(&self, _: &SessionStatus) -> StorageResult<()> {
        Ok(())
    }
}
