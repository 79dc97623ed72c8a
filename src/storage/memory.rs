use async_trait::async_trait;
use dashmap::DashMap;

use super::SessionStore;
use crate::error::{PilotError, Result};
use crate::metrics::SessionReport;
use crate::recovery::{Checkpoint, RefundRecord};
use crate::session::{SessionId, UnitBatch};

/// Process-local store for tests and dry runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    batches: DashMap<SessionId, UnitBatch>,
    checkpoints: DashMap<SessionId, Vec<Checkpoint>>,
    refunds: DashMap<SessionId, RefundRecord>,
    reports: DashMap<SessionId, SessionReport>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self, session_id: &SessionId) -> usize {
        self.checkpoints
            .get(session_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_batch(&self, batch: &UnitBatch) -> Result<()> {
        self.batches
            .insert(batch.session_id.clone(), batch.clone());
        Ok(())
    }

    async fn load_batch(&self, session_id: &SessionId) -> Result<UnitBatch> {
        self.batches
            .get(session_id)
            .map(|b| b.clone())
            .ok_or_else(|| PilotError::BatchNotFound(session_id.to_string()))
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .entry(checkpoint.session_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .get(session_id)
            .and_then(|c| c.last().cloned()))
    }

    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .get(session_id)
            .map(|c| c.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_refund(&self, session_id: &SessionId) -> Result<Option<RefundRecord>> {
        Ok(self.refunds.get(session_id).map(|r| r.clone()))
    }

    async fn record_refund(&self, record: &RefundRecord) -> Result<()> {
        self.refunds
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn save_report(&self, report: &SessionReport) -> Result<()> {
        self.reports
            .insert(report.summary.session_id.clone(), report.clone());
        Ok(())
    }

    async fn load_report(&self, session_id: &SessionId) -> Result<SessionReport> {
        self.reports
            .get(session_id)
            .map(|r| r.clone())
            .ok_or_else(|| PilotError::ReportNotFound(session_id.to_string()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.batches.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
