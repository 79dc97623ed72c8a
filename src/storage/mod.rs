//! Durable session state: unit batches, checkpoints, refund records and reports.
//!
//! A write is only acknowledged once it is flushed; resume logic relies on
//! `latest_checkpoint` surviving a process restart.

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::metrics::SessionReport;
use crate::recovery::{Checkpoint, RefundRecord};
use crate::session::{SessionId, UnitBatch};

pub use file::FileStore;
pub use memory::MemoryStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_batch(&self, batch: &UnitBatch) -> Result<()>;

    async fn load_batch(&self, session_id: &SessionId) -> Result<UnitBatch>;

    /// Append a checkpoint. Checkpoints are never overwritten.
    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn latest_checkpoint(&self, session_id: &SessionId) -> Result<Option<Checkpoint>>;

    /// All checkpoints for a session, newest first.
    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>>;

    async fn find_refund(&self, session_id: &SessionId) -> Result<Option<RefundRecord>>;

    /// Insert or replace the refund record for its session.
    async fn record_refund(&self, record: &RefundRecord) -> Result<()>;

    async fn save_report(&self, report: &SessionReport) -> Result<()>;

    async fn load_report(&self, session_id: &SessionId) -> Result<SessionReport>;

    /// Sessions that have a persisted unit batch.
    async fn list_sessions(&self) -> Result<Vec<SessionId>>;
}
