use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::retry::RetryPolicy;
use crate::error::{ErrorKind, ExecutionError, Result};
use crate::external::{Ledger, Signer, TransferReceipt};
use crate::session::SessionId;
use crate::storage::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Written before the transfer is sent. Still pending on a later read
    /// means the transfer outcome was never recorded.
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted refund obligation, keyed by session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub session_id: SessionId,
    pub payer_account: String,
    pub amount: Decimal,
    pub status: RefundStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Transfer attempts across every refund call for this session.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RefundStatus::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.status == RefundStatus::Pending
    }

    /// Why the refund has not completed.
    pub fn shortfall(&self) -> String {
        match self.status {
            RefundStatus::Completed => "completed".to_string(),
            RefundStatus::Pending => {
                "transfer outcome unknown, reconcile the ledger".to_string()
            }
            RefundStatus::Failed => self
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        }
    }
}

/// Result of a refund call.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundOutcome {
    pub record: RefundRecord,
    /// A completed or in-flight refund was already on record; nothing was
    /// transferred.
    pub already_recorded: bool,
}

/// What to refund and why.
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub session_id: SessionId,
    pub payer_account: String,
    pub amount: Decimal,
    pub reason: String,
}

/// Issues idempotent refunds of a session's upfront payment.
///
/// The record goes to the store as `Pending` before any money moves and is
/// rewritten with the transfer outcome afterwards, so a failed write can
/// never lead to a second transfer.
pub struct RefundManager {
    ledger: Arc<dyn Ledger>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    operating_account: String,
    call_timeout: Duration,
    // Check-then-transfer runs under the session's lock.
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl RefundManager {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn SessionStore>,
        retry: RetryPolicy,
        operating_account: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            signer,
            store,
            retry,
            operating_account: operating_account.into(),
            call_timeout,
            locks: DashMap::new(),
        }
    }

    /// Refund `request.amount` to the payer unless a completed or pending
    /// refund for the session is already recorded. A failed transfer is
    /// persisted as `Failed` so the obligation stays visible and can be
    /// retried.
    pub async fn refund(&self, request: RefundRequest) -> Result<RefundOutcome> {
        let lock = self.session_lock(&request.session_id);
        let _guard = lock.lock().await;

        let previous = self.store.find_refund(&request.session_id).await?;
        if let Some(record) = &previous {
            match record.status {
                RefundStatus::Completed => {
                    info!(
                        session_id = %request.session_id,
                        correlation_ref = record.correlation_ref.as_deref().unwrap_or(""),
                        "Refund already recorded; skipping"
                    );
                    return Ok(RefundOutcome {
                        record: record.clone(),
                        already_recorded: true,
                    });
                }
                RefundStatus::Pending => {
                    warn!(
                        session_id = %request.session_id,
                        amount = %record.amount,
                        "Earlier refund never recorded an outcome; not transferring again"
                    );
                    return Ok(RefundOutcome {
                        record: record.clone(),
                        already_recorded: true,
                    });
                }
                RefundStatus::Failed => {}
            }
        }

        let mut record = RefundRecord {
            session_id: request.session_id.clone(),
            payer_account: request.payer_account.clone(),
            amount: request.amount,
            status: RefundStatus::Pending,
            reason: request.reason.clone(),
            correlation_ref: None,
            error: None,
            error_kind: None,
            attempts: previous.as_ref().map(|r| r.attempts).unwrap_or(0),
            created_at: previous
                .as_ref()
                .map(|r| r.created_at)
                .unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
        };
        self.store.record_refund(&record).await?;

        let (result, attempts) = self.transfer_with_retry(&request).await;
        record.attempts += attempts;
        record.updated_at = Utc::now();
        match result {
            Ok(receipt) => {
                info!(
                    session_id = %request.session_id,
                    amount = %request.amount,
                    correlation_ref = receipt.correlation_ref,
                    "Refund issued"
                );
                record.status = RefundStatus::Completed;
                record.correlation_ref = Some(receipt.correlation_ref);
            }
            Err(e) => {
                error!(
                    session_id = %request.session_id,
                    amount = %request.amount,
                    error = %e,
                    "Refund failed"
                );
                record.status = RefundStatus::Failed;
                record.error = Some(e.to_string());
                record.error_kind = Some(e.kind());
            }
        }

        self.store.record_refund(&record).await.inspect_err(|e| {
            error!(
                session_id = %request.session_id,
                status = %record.status,
                error = %e,
                "Refund outcome not persisted; record stays pending"
            );
        })?;
        Ok(RefundOutcome {
            record,
            already_recorded: false,
        })
    }

    pub async fn find(&self, session_id: &SessionId) -> Result<Option<RefundRecord>> {
        self.store.find_refund(session_id).await
    }

    fn session_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(session_id.clone()).or_default().value())
    }

    async fn transfer_with_retry(
        &self,
        request: &RefundRequest,
    ) -> (std::result::Result<TransferReceipt, ExecutionError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let transfer = self.ledger.transfer(
                &self.operating_account,
                &request.payer_account,
                request.amount,
                self.signer.as_ref(),
            );
            let result = match tokio::time::timeout(self.call_timeout, transfer).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout {
                    operation: "refund transfer".to_string(),
                    duration_ms: u64::try_from(self.call_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }),
            };
            match result {
                Ok(receipt) => return (Ok(receipt), attempt),
                Err(e) => match self.retry.next_delay(&e, attempt) {
                    Some(delay) => {
                        warn!(
                            session_id = %request.session_id,
                            attempt,
                            error = %e,
                            "Refund transfer failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return (Err(e), attempt),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::external::{SimulatedLedger, SimulatedSigner};
    use crate::storage::MemoryStore;

    /// Ledger whose transfers to `stalled` never complete.
    struct StallingLedger {
        inner: Arc<SimulatedLedger>,
        stalled: String,
    }

    #[async_trait]
    impl Ledger for StallingLedger {
        async fn get_balance(&self, account: &str) -> std::result::Result<Decimal, ExecutionError> {
            self.inner.get_balance(account).await
        }

        async fn transfer(
            &self,
            from: &str,
            to: &str,
            amount: Decimal,
            signer: &dyn Signer,
        ) -> std::result::Result<TransferReceipt, ExecutionError> {
            if to == self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.transfer(from, to, amount, signer).await
        }
    }

    fn setup(balance: Decimal) -> (RefundManager, Arc<SimulatedLedger>, Arc<MemoryStore>) {
        let ledger = Arc::new(SimulatedLedger::new());
        ledger.credit("operating", balance);
        let store = Arc::new(MemoryStore::new());
        let manager = RefundManager::new(
            ledger.clone(),
            Arc::new(SimulatedSigner::new()),
            store.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            "operating",
            Duration::from_secs(5),
        );
        (manager, ledger, store)
    }

    fn request() -> RefundRequest {
        RefundRequest {
            session_id: SessionId::from("ses-refund"),
            payer_account: "payer".into(),
            amount: dec!(3.20),
            reason: "failure rate".into(),
        }
    }

    #[tokio::test]
    async fn test_refund_twice_records_one_transfer() {
        let (manager, ledger, _) = setup(dec!(5));

        let first = manager.refund(request()).await.unwrap();
        let second = manager.refund(request()).await.unwrap();

        assert!(!first.already_recorded);
        assert!(second.already_recorded);
        assert_eq!(first.record, second.record);
        assert_eq!(ledger.transfers().len(), 1);
        assert_eq!(ledger.balance("payer"), dec!(3.20));
    }

    #[tokio::test]
    async fn test_concurrent_refunds_transfer_once() {
        let (manager, ledger, _) = setup(dec!(10));
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&manager);
                tokio::spawn(async move { m.refund(request()).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(ledger.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refund_keeps_obligation_then_retry_completes() {
        let (manager, ledger, store) = setup(dec!(1));

        let failed = manager.refund(request()).await.unwrap();
        assert_eq!(failed.record.status, RefundStatus::Failed);
        assert_eq!(failed.record.error_kind, Some(ErrorKind::InsufficientFunds));
        let stored = store
            .find_refund(&SessionId::from("ses-refund"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, RefundStatus::Failed);

        ledger.credit("operating", dec!(5));
        let retried = manager.refund(request()).await.unwrap();
        assert!(retried.record.is_completed());
        assert_eq!(retried.record.attempts, 2);
        assert_eq!(retried.record.created_at, failed.record.created_at);
        assert_eq!(ledger.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_record_blocks_second_transfer() {
        let (manager, ledger, store) = setup(dec!(5));
        let now = Utc::now();
        store
            .record_refund(&RefundRecord {
                session_id: SessionId::from("ses-refund"),
                payer_account: "payer".into(),
                amount: dec!(3.20),
                status: RefundStatus::Pending,
                reason: "failure rate".into(),
                correlation_ref: None,
                error: None,
                error_kind: None,
                attempts: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let outcome = manager.refund(request()).await.unwrap();

        assert!(outcome.already_recorded);
        assert!(outcome.record.is_pending());
        assert!(outcome.record.shortfall().contains("reconcile"));
        assert!(ledger.transfers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transfer_times_out_without_blocking_other_sessions() {
        let inner = Arc::new(SimulatedLedger::new());
        inner.credit("operating", dec!(10));
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(RefundManager::new(
            Arc::new(StallingLedger {
                inner: inner.clone(),
                stalled: "stuck-payer".into(),
            }),
            Arc::new(SimulatedSigner::new()),
            store,
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            "operating",
            Duration::from_secs(5),
        ));

        let stuck = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move {
                m.refund(RefundRequest {
                    session_id: SessionId::from("ses-stuck"),
                    payer_account: "stuck-payer".into(),
                    amount: dec!(1),
                    reason: "stopped".into(),
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let other = manager.refund(request()).await.unwrap();
        assert!(other.record.is_completed());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!stuck.is_finished());

        let stuck = stuck.await.unwrap().unwrap();
        assert_eq!(stuck.record.status, RefundStatus::Failed);
        assert_eq!(stuck.record.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(stuck.record.attempts, 2);
        assert_eq!(inner.balance("payer"), dec!(3.20));
        assert_eq!(inner.balance("stuck-payer"), dec!(0));
    }
}
