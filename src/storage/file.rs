use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;

use super::{SessionStore, StorageResult};
use crate::{
    common::GlobalArtifact,
    session::{RoundSummary, SessionStatus},
};

/// Writes the session to a directory:
///
/// - `round-NNNN-A.json`: the summary of attempt `A` at round `NNNN`
/// - `model-NNNN.bin` and `model-latest.bin`: the artifact produced by round `NNNN`
/// - `session.json`: the latest session status
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Create the store, creating `directory` if needed.
    pub async fn new<P: Into<PathBuf>>(directory: P) -> StorageResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("failed to create {}", directory.display()))?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        // write then rename, so readers never see a partial file
        let path = self.directory.join(name);
        let tmp = self.directory.join(format!(".{}.tmp", name));
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn save_round(&self, summary: &RoundSummary) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(summary)?;
        self.write(
            &format!("round-{:04}-{}.json", summary.round, summary.attempt),
            &json,
        )
        .await
    }

    async fn save_artifact(&self, artifact: &GlobalArtifact) -> StorageResult<()> {
        let bytes = artifact.to_bytes()?;
        if let Some(version) = artifact.version() {
            self.write(&format!("model-{:04}.bin", version), &bytes)
                .await?;
        }
        self.write("model-latest.bin", &bytes).await
    }

    async fn save_status(&self, status: &SessionStatus) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(status)?;
        self.write("session.json", &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[tokio::test]
    async fn test_file_store() {
        let dir = std::env::temp_dir().join(format!("fl-store-{}", uuid::Uuid::new_v4()));
        let store = FileStore::new(&dir).await.unwrap();

        let artifact = GlobalArtifact::produce(3, vec![1.0, 2.0]);
        store.save_artifact(&artifact).await.unwrap();
        let latest = std::fs::read(dir.join("model-latest.bin")).unwrap();
        assert_eq!(GlobalArtifact::from_bytes(&latest).unwrap(), artifact);
        assert!(dir.join("model-0003.bin").exists());

        let status = SessionStatus {
            state: SessionState::Finalized,
            current_round: None,
            rounds_completed: 4,
            total_rounds: 4,
            model_version: Some(3),
            reason: None,
        };
        store.save_status(&status).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("session.json")).unwrap()).unwrap();
        assert_eq!(json["state"], "FINALIZED");
        assert_eq!(json["model_version"], 3);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
