use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::external::{Execution, Ledger, Router, Signer, TransferReceipt};
use crate::recovery::{RecoveryAction, RecoveryManager};
use crate::session::{SessionId, UnitPhase};

/// One unit leg to execute.
#[derive(Debug, Clone)]
pub struct UnitJob {
    pub session_id: SessionId,
    pub unit: usize,
    pub handle: String,
    pub phase: UnitPhase,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitResult {
    Succeeded(Execution),
    Failed(ExecutionError),
    /// Cancelled before any attempt landed.
    Cancelled,
}

enum Retried<T> {
    Done(T),
    Failed(ExecutionError),
    Cancelled,
}

/// Outcome of a unit leg across all its attempts.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub unit: usize,
    pub phase: UnitPhase,
    pub attempts: u32,
    pub result: UnitResult,
}

impl ExecutionReport {
    pub fn is_critical(&self) -> bool {
        matches!(&self.result, UnitResult::Failed(e) if e.is_critical())
    }
}

/// Runs one activation or collection against the router, retrying transient
/// failures with backoff. Activation first checks that the operating account
/// covers the unit. Every external call is bounded by `call_timeout`.
pub struct UnitExecutor {
    router: Arc<dyn Router>,
    signer: Arc<dyn Signer>,
    ledger: Arc<dyn Ledger>,
    recovery: Arc<RecoveryManager>,
    operating_account: String,
    call_timeout: Duration,
}

impl UnitExecutor {
    pub fn new(
        router: Arc<dyn Router>,
        signer: Arc<dyn Signer>,
        ledger: Arc<dyn Ledger>,
        recovery: Arc<RecoveryManager>,
        operating_account: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            router,
            signer,
            ledger,
            recovery,
            operating_account: operating_account.into(),
            call_timeout,
        }
    }

    pub async fn execute(&self, job: &UnitJob, cancel: &CancellationToken) -> ExecutionReport {
        let (result, attempts) = self
            .with_retry(&job.session_id, &job.handle, job.phase.as_str(), cancel, || {
                self.attempt(job)
            })
            .await;

        let result = match result {
            Retried::Done(execution) => {
                debug!(
                    session_id = %job.session_id,
                    unit = job.handle,
                    phase = job.phase.as_str(),
                    attempts,
                    correlation_ref = execution.correlation_ref,
                    "Unit leg executed"
                );
                UnitResult::Succeeded(execution)
            }
            Retried::Failed(err) => UnitResult::Failed(err),
            Retried::Cancelled => UnitResult::Cancelled,
        };

        ExecutionReport {
            unit: job.unit,
            phase: job.phase,
            attempts,
            result,
        }
    }

    /// Move `amount` from the operating account to `destination` under the
    /// same retry and timeout policy as unit legs.
    pub async fn transfer_out(
        &self,
        session_id: &SessionId,
        destination: &str,
        amount: Decimal,
        cancel: &CancellationToken,
    ) -> (Result<TransferReceipt, ExecutionError>, u32) {
        let (result, attempts) = self
            .with_retry(session_id, destination, "consolidation", cancel, || async {
                if !self.signer.is_connected().await {
                    return Err(ExecutionError::SignerDisconnected);
                }
                self.bounded(
                    "transfer",
                    self.ledger.transfer(
                        &self.operating_account,
                        destination,
                        amount,
                        self.signer.as_ref(),
                    ),
                )
                .await
            })
            .await;

        let result = match result {
            Retried::Done(receipt) => Ok(receipt),
            Retried::Failed(err) => Err(err),
            Retried::Cancelled => Err(ExecutionError::Other("transfer cancelled".to_string())),
        };
        (result, attempts)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        session_id: &SessionId,
        target: &str,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> (Retried<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return (Retried::Cancelled, attempt);
            }
            attempt += 1;

            let err = match op().await {
                Ok(value) => return (Retried::Done(value), attempt),
                Err(e) => e,
            };

            let Some(decision) = self.recovery.decide_attempt(&err, attempt) else {
                warn!(
                    session_id = %session_id,
                    target,
                    phase = label,
                    attempt,
                    error = %err,
                    "Giving up after attempt"
                );
                return (Retried::Failed(err), attempt);
            };
            let RecoveryAction::Retry { delay_ms } = decision.action else {
                return (Retried::Failed(err), attempt);
            };

            warn!(
                session_id = %session_id,
                target,
                phase = label,
                attempt,
                delay_ms,
                error = %err,
                "Retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return (Retried::Failed(err), attempt),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
    }

    async fn attempt(&self, job: &UnitJob) -> Result<Execution, ExecutionError> {
        if !self.signer.is_connected().await {
            return Err(ExecutionError::SignerDisconnected);
        }

        let (from, to) = match job.phase {
            UnitPhase::Activation => {
                let available = self
                    .bounded("balance lookup", self.ledger.get_balance(&self.operating_account))
                    .await?;
                if available < job.amount {
                    return Err(ExecutionError::InsufficientFunds {
                        required: job.amount.to_string(),
                        available: available.to_string(),
                    });
                }
                (self.operating_account.as_str(), job.handle.as_str())
            }
            UnitPhase::Collection => (job.handle.as_str(), self.operating_account.as_str()),
        };

        let quote = self
            .bounded("quote", self.router.quote(from, to, job.amount))
            .await?;
        let execution = self
            .bounded("execute", self.router.execute(&quote, self.signer.as_ref()))
            .await?;

        if execution.correlation_ref.trim().is_empty() {
            return Err(ExecutionError::ExecutionFailed {
                message: "router returned no correlation reference".to_string(),
                transient: false,
            });
        }
        Ok(execution)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, ExecutionError>>,
    ) -> Result<T, ExecutionError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout {
                operation: operation.to_string(),
                duration_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::RecoveryConfig;
    use crate::external::{Scripted, SimulatedLedger, SimulatedRouter, SimulatedSigner};
    use crate::recovery::RetryPolicy;

    struct Harness {
        executor: UnitExecutor,
        router: Arc<SimulatedRouter>,
        signer: Arc<SimulatedSigner>,
    }

    fn harness(router: SimulatedRouter, balance: Decimal) -> Harness {
        let router = Arc::new(router);
        let signer = Arc::new(SimulatedSigner::new());
        let ledger = Arc::new(SimulatedLedger::new());
        ledger.credit("operating", balance);
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5)),
        ));
        let executor = UnitExecutor::new(
            router.clone(),
            signer.clone(),
            ledger,
            recovery,
            "operating",
            Duration::from_secs(2),
        );
        Harness {
            executor,
            router,
            signer,
        }
    }

    fn job(phase: UnitPhase) -> UnitJob {
        UnitJob {
            session_id: SessionId::from("ses-exec"),
            unit: 3,
            handle: "unit-003".into(),
            phase,
            amount: dec!(0.02),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let h = harness(SimulatedRouter::new("operating"), dec!(1));
        h.router.script(
            "unit-003",
            [
                Scripted::Fail(ExecutionError::execution_failed("stale reference")),
                Scripted::Fail(ExecutionError::RouteUnavailable("pool busy".into())),
                Scripted::Succeed,
            ],
        );

        let report = h
            .executor
            .execute(&job(UnitPhase::Activation), &CancellationToken::new())
            .await;
        assert_eq!(report.attempts, 3);
        assert!(matches!(report.result, UnitResult::Succeeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let h = harness(SimulatedRouter::new("operating"), dec!(1));
        h.router.script(
            "unit-003",
            [Scripted::FailAlways(ExecutionError::RouteUnavailable("none".into()))],
        );

        let report = h
            .executor
            .execute(&job(UnitPhase::Activation), &CancellationToken::new())
            .await;
        assert_eq!(report.attempts, 4);
        assert!(matches!(
            report.result,
            UnitResult::Failed(ExecutionError::RouteUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_not_retried() {
        let h = harness(SimulatedRouter::new("operating"), dec!(0.01));
        let report = h
            .executor
            .execute(&job(UnitPhase::Activation), &CancellationToken::new())
            .await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(
            report.result,
            UnitResult::Failed(ExecutionError::InsufficientFunds { .. })
        ));
        assert_eq!(h.router.execution_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_skips_balance_check() {
        let h = harness(SimulatedRouter::new("operating"), Decimal::ZERO);
        let report = h
            .executor
            .execute(&job(UnitPhase::Collection), &CancellationToken::new())
            .await;
        assert!(matches!(report.result, UnitResult::Succeeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_signer_is_critical() {
        let h = harness(SimulatedRouter::new("operating"), dec!(1));
        h.signer.disconnect();
        let report = h
            .executor
            .execute(&job(UnitPhase::Activation), &CancellationToken::new())
            .await;
        assert!(report.is_critical());
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_router_times_out_and_retries() {
        let h = harness(
            SimulatedRouter::new("operating").with_latency(Duration::from_secs(10)),
            dec!(1),
        );
        let report = h
            .executor
            .execute(&job(UnitPhase::Activation), &CancellationToken::new())
            .await;
        assert_eq!(report.attempts, 4);
        assert!(matches!(
            report.result,
            UnitResult::Failed(ExecutionError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let h = harness(SimulatedRouter::new("operating"), dec!(1));
        h.router.script(
            "unit-003",
            [Scripted::FailAlways(ExecutionError::execution_failed("stale"))],
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = h.executor.execute(&job(UnitPhase::Activation), &cancel).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(h.router.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(SimulatedRouter::new("operating"), dec!(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.executor.execute(&job(UnitPhase::Activation), &cancel).await;
        assert_eq!(report.result, UnitResult::Cancelled);
        assert_eq!(report.attempts, 0);
    }
}
