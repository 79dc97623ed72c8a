use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, info, warn};

use super::SessionStore;
use crate::config::ProjectPaths;
use crate::error::{PilotError, Result};
use crate::metrics::SessionReport;
use crate::recovery::{Checkpoint, RefundRecord};
use crate::session::{SessionId, UnitBatch};

/// YAML/JSON files under the data directory:
///
/// ```text
/// sessions/<id>.yaml              unit batch
/// checkpoints/<id>/<cp-id>.yaml   append-only checkpoints
/// refunds/<id>.yaml               refund record
/// reports/<id>.json               archived report
/// ```
pub struct FileStore {
    paths: ProjectPaths,
}

impl FileStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub async fn init(&self) -> Result<()> {
        self.paths.ensure_dirs().await?;
        for dir in [
            &self.paths.sessions_dir,
            &self.paths.refunds_dir,
            &self.paths.reports_dir,
        ] {
            Self::recover_interrupted_writes(dir).await;
        }
        Ok(())
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    fn batch_path(&self, session_id: &SessionId) -> PathBuf {
        self.paths
            .sessions_dir
            .join(format!("{}.yaml", session_id))
    }

    fn checkpoint_dir(&self, session_id: &SessionId) -> PathBuf {
        self.paths.checkpoints_dir.join(session_id.as_str())
    }

    fn refund_path(&self, session_id: &SessionId) -> PathBuf {
        self.paths
            .refunds_dir
            .join(format!("{}.yaml", session_id))
    }

    pub fn report_path(&self, session_id: &SessionId) -> PathBuf {
        self.paths
            .reports_dir
            .join(format!("{}.json", session_id))
    }

    async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let content = serde_yaml_bw::to_string(value)?;
        Self::write_atomic(path, &content).await
    }

    async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_yaml_bw::from_str(&content)?)
    }

    /// Temp file, fsync, rename. The write is durable once this returns.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, content).await?;

        let tmp_path_clone = tmp_path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_path_clone).and_then(|file| file.sync_all())
        })
        .await
        .map_err(|e| PilotError::Persistence(format!("sync task failed: {}", e)))??;

        fs::rename(&tmp_path, path).await.inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp_path);
        })?;

        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }

    async fn recover_interrupted_writes(dir: &Path) {
        if let Ok(mut entries) = fs::read_dir(dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    /// Checkpoint file stems, newest first. Ids are timestamp-prefixed so
    /// name order is creation order.
    async fn checkpoint_ids(&self, session_id: &SessionId) -> Result<Vec<String>> {
        let dir = self.checkpoint_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "yaml")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(name.to_string());
            }
        }
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn save_batch(&self, batch: &UnitBatch) -> Result<()> {
        Self::write_yaml(&self.batch_path(&batch.session_id), batch).await
    }

    async fn load_batch(&self, session_id: &SessionId) -> Result<UnitBatch> {
        let path = self.batch_path(session_id);
        if !path.exists() {
            return Err(PilotError::BatchNotFound(session_id.to_string()));
        }
        Self::read_yaml(&path).await
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self
            .checkpoint_dir(&checkpoint.session_id)
            .join(format!("{}.yaml", checkpoint.id));
        if path.exists() {
            return Err(PilotError::Persistence(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        Self::write_yaml(&path, checkpoint).await?;
        info!(
            checkpoint_id = checkpoint.id,
            session_id = %checkpoint.session_id,
            phase = checkpoint.phase.as_str(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn latest_checkpoint(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        let ids = self.checkpoint_ids(session_id).await?;
        let Some(latest) = ids.first() else {
            return Ok(None);
        };

        let path = self
            .checkpoint_dir(session_id)
            .join(format!("{}.yaml", latest));
        match Self::read_yaml(&path).await {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(checkpoint_id = latest, error = %e, "Failed to load latest checkpoint");
                Err(e)
            }
        }
    }

    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>> {
        let dir = self.checkpoint_dir(session_id);
        let mut checkpoints = Vec::new();
        for id in self.checkpoint_ids(session_id).await? {
            match Self::read_yaml::<Checkpoint>(&dir.join(format!("{}.yaml", id))).await {
                Ok(cp) => checkpoints.push(cp),
                Err(e) => warn!(checkpoint_id = id, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(checkpoints)
    }

    async fn find_refund(&self, session_id: &SessionId) -> Result<Option<RefundRecord>> {
        let path = self.refund_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_yaml(&path).await?))
    }

    async fn record_refund(&self, record: &RefundRecord) -> Result<()> {
        Self::write_yaml(&self.refund_path(&record.session_id), record).await
    }

    async fn save_report(&self, report: &SessionReport) -> Result<()> {
        let json = report.to_json()?;
        Self::write_atomic(&self.report_path(&report.summary.session_id), &json).await
    }

    async fn load_report(&self, session_id: &SessionId) -> Result<SessionReport> {
        let path = self.report_path(session_id);
        if !path.exists() {
            return Err(PilotError::ReportNotFound(session_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let dir = &self.paths.sessions_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "yaml")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(SessionId::from(name));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
