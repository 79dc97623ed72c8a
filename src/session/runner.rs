//! Background driver for a running session.
//!
//! Each unit phase fires its units on their scheduled offsets, runs them with
//! bounded concurrency, and waits at a barrier until every unit has an
//! outcome. Recovery is decided at the barrier; a critical error cancels the
//! phase early.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::controller::SessionController;
use super::model::{Consolidation, SessionStatus, UnitPhase};
use super::phase::SessionPhase;
use super::registry::{SessionHandle, SessionState};
use crate::error::{ErrorKind, ExecutionError, PilotError, Result};
use crate::execution::{ExecutionReport, UnitJob, UnitResult};
use crate::notification::{EventType, SessionEvent};
use crate::recovery::{FailureContext, RecoveryAction, RecoveryDecision};
use crate::scheduler::EventQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PhaseStep {
    /// Moved on to the next phase.
    Advanced,
    /// Session recovery: run the same phase again.
    Retry,
    /// The session ended or was stopped.
    Finished,
}

impl SessionController {
    pub(super) async fn drive(self, handle: Arc<SessionHandle>) {
        if let Err(e) = self.drive_phases(&handle).await {
            error!(session_id = %handle.id(), error = %e, "Session driver failed");
            if let Err(e) = self.abort(&handle, e).await {
                error!(session_id = %handle.id(), error = %e, "Failed to settle aborted session");
            }
        }
    }

    async fn drive_phases(&self, handle: &Arc<SessionHandle>) -> Result<()> {
        loop {
            if handle.cancel_token().is_cancelled() {
                return Ok(());
            }
            let step = match handle.phase() {
                SessionPhase::Distributing => {
                    self.run_unit_phase(handle, UnitPhase::Activation).await?
                }
                SessionPhase::Collecting => {
                    self.run_unit_phase(handle, UnitPhase::Collection).await?
                }
                SessionPhase::Consolidating => self.consolidate(handle).await?,
                _ => return Ok(()),
            };
            debug!(session_id = %handle.id(), ?step, "Phase step");
            if step == PhaseStep::Finished {
                return Ok(());
            }
        }
    }

    async fn run_unit_phase(
        &self,
        handle: &Arc<SessionHandle>,
        phase: UnitPhase,
    ) -> Result<PhaseStep> {
        let (jobs, anchor) = {
            let st = handle.lock();
            let anchor = st.session.phase_started_at.unwrap_or_else(Utc::now);
            let jobs: Vec<(UnitJob, Duration)> = st
                .units
                .iter()
                .filter(|u| u.needs_action(phase))
                .map(|u| {
                    let job = UnitJob {
                        session_id: st.session.id.clone(),
                        unit: u.index,
                        handle: u.handle.clone(),
                        phase,
                        amount: u.amount_for(phase),
                    };
                    (job, u.event(phase).offset())
                })
                .collect();
            (jobs, anchor)
        };
        info!(
            session_id = %handle.id(),
            phase = phase.as_str(),
            pending = jobs.len(),
            "Running unit phase"
        );

        let cancel = handle.cancel_token().child_token();
        let mut queue = EventQueue::new();
        let now = Utc::now();
        for (job, offset) in jobs {
            let due = chrono::Duration::from_std(offset)
                .map(|offset| anchor + offset)
                .unwrap_or(now);
            let delay = (due - now).to_std().unwrap_or(Duration::ZERO);
            queue.schedule_in(delay, job);
        }

        let permits = Arc::new(Semaphore::new(
            self.inner.config.execution.max_concurrent_units.max(1),
        ));
        let mut in_flight: JoinSet<ExecutionReport> = JoinSet::new();
        let mut critical: Option<ExecutionError> = None;

        while !(queue.is_empty() && in_flight.is_empty()) {
            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !queue.is_empty() => {
                    let dropped = queue.drain();
                    debug!(
                        session_id = %handle.id(),
                        dropped = dropped.len(),
                        "Phase cancelled; dropping unfired timers"
                    );
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(report) => {
                            if critical.is_none()
                                && let UnitResult::Failed(err) = &report.result
                                && err.is_critical()
                            {
                                warn!(
                                    session_id = %handle.id(),
                                    unit = report.unit,
                                    error = %err,
                                    "Critical error; cancelling phase"
                                );
                                critical = Some(err.clone());
                                cancel.cancel();
                            }
                            self.apply_report(handle, report).await;
                        }
                        Err(e) => {
                            error!(session_id = %handle.id(), error = %e, "Unit task aborted");
                            if critical.is_none() {
                                critical = Some(ExecutionError::Critical(format!(
                                    "unit task aborted: {}",
                                    e
                                )));
                                cancel.cancel();
                            }
                        }
                    }
                }

                job = queue.wait_next(), if !queue.is_empty() => {
                    let executor = Arc::clone(&self.inner.executor);
                    let permits = Arc::clone(&permits);
                    let token = cancel.clone();
                    in_flight.spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        executor.execute(&job, &token).await
                    });
                }
            }
        }

        if handle.cancel_token().is_cancelled() {
            return Ok(PhaseStep::Finished);
        }
        if let Some(err) = critical {
            return self
                .handle_failure(handle, Some(err.kind()), None)
                .await;
        }

        let remaining = {
            let st = handle.lock();
            if st.session.phase != phase.session_phase() {
                return Ok(PhaseStep::Finished);
            }
            st.units.iter().filter(|u| u.needs_action(phase)).count()
        };
        if remaining > 0 {
            info!(
                session_id = %handle.id(),
                phase = phase.as_str(),
                remaining,
                "Phase barrier reached with failed units"
            );
            return self.handle_failure(handle, None, None).await;
        }

        let next = match phase {
            UnitPhase::Activation => SessionPhase::Collecting,
            UnitPhase::Collection => SessionPhase::Consolidating,
        };
        self.advance(handle, next).await
    }

    /// Apply one unit outcome. Executions still in flight when the session is
    /// stopped are recorded as they drain, so unit state matches the ledger
    /// by the time the stop returns. Outcomes for a phase the session has
    /// moved past are discarded.
    async fn apply_report(&self, handle: &SessionHandle, report: ExecutionReport) {
        let event = {
            let mut st = handle.lock();
            let phase = st.session.phase;
            if phase != report.phase.session_phase() && !phase.is_terminal() {
                debug!(
                    session_id = %handle.id(),
                    unit = report.unit,
                    "Discarding outcome for ended phase"
                );
                return;
            }

            let SessionState {
                session,
                units,
                metrics,
            } = &mut *st;
            let Some(unit) = units.get_mut(report.unit) else {
                warn!(session_id = %handle.id(), unit = report.unit, "Outcome for unknown unit");
                return;
            };

            let event = match report.result {
                UnitResult::Succeeded(execution) => {
                    unit.record_success(
                        report.phase,
                        report.attempts,
                        execution.correlation_ref.clone(),
                        execution.realized_amount,
                    );
                    metrics.record_success(
                        unit.index,
                        report.phase,
                        &execution.correlation_ref,
                        unit.profit,
                    );
                    self.inner.metrics.unit_executed(true);
                    None
                }
                UnitResult::Failed(err) => {
                    error!(
                        session_id = %session.id,
                        unit = unit.handle,
                        phase = report.phase.as_str(),
                        attempts = report.attempts,
                        error = %err,
                        "Unit failed"
                    );
                    unit.record_failure(report.phase, report.attempts, err.kind(), err.to_string());
                    metrics.record_failure(unit.index, err.kind());
                    self.inner.metrics.unit_executed(false);
                    Some(
                        SessionEvent::new(EventType::UnitFailed, &session.id)
                            .with_phase(session.phase)
                            .with_unit(unit.handle.clone())
                            .with_message(err.to_string()),
                    )
                }
                UnitResult::Cancelled => None,
            };

            st.refresh_progress();
            st.session.touch();
            event.map(|e| e.with_progress(st.session.progress))
        };

        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    async fn advance(&self, handle: &SessionHandle, next: SessionPhase) -> Result<PhaseStep> {
        let progress = {
            let mut st = handle.lock();
            if st.session.phase.is_terminal() {
                return Ok(PhaseStep::Finished);
            }
            let from = st.session.phase;
            st.transition(next, format!("All units through {}", from))?;
            st.session.status = SessionStatus::info(match next {
                SessionPhase::Collecting => format!(
                    "Collecting {} units over {}s",
                    st.session.unit_count, st.session.collection_window_secs
                ),
                _ => format!("Consolidating to {}", st.session.destination_account),
            });
            st.session.progress
        };
        handle.publish_phase(next);
        self.checkpoint(handle, format!("entered {}", next.as_str()))
            .await?;

        info!(session_id = %handle.id(), phase = %next, progress, "Phase advanced");
        self.emit(
            SessionEvent::new(EventType::PhaseChanged, handle.id())
                .with_phase(next)
                .with_progress(progress),
        )
        .await;
        Ok(PhaseStep::Advanced)
    }

    /// Move aggregated proceeds to the destination and complete the session.
    async fn consolidate(&self, handle: &SessionHandle) -> Result<PhaseStep> {
        let (amount, destination) = {
            let st = handle.lock();
            let amount: Decimal = st
                .units
                .iter()
                .filter_map(|u| u.collection.realized_amount)
                .sum();
            (amount, st.session.destination_account.clone())
        };

        let (result, attempts) = self
            .inner
            .executor
            .transfer_out(handle.id(), &destination, amount, handle.cancel_token())
            .await;
        if handle.cancel_token().is_cancelled() {
            // The transfer may have landed before the stop; keep its receipt.
            if let Ok(receipt) = &result {
                handle.lock().session.consolidation = Some(Consolidation {
                    correlation_ref: receipt.correlation_ref.clone(),
                    destination,
                    amount: receipt.amount,
                    at: Utc::now(),
                });
            }
            return Ok(PhaseStep::Finished);
        }

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(err) => {
                error!(
                    session_id = %handle.id(),
                    attempts,
                    error = %err,
                    "Consolidation transfer failed"
                );
                let critical = err.is_critical().then(|| err.kind());
                return self.handle_failure(handle, critical, Some(err.kind())).await;
            }
        };

        {
            let mut st = handle.lock();
            st.session.consolidation = Some(Consolidation {
                correlation_ref: receipt.correlation_ref.clone(),
                destination: destination.clone(),
                amount: receipt.amount,
                at: Utc::now(),
            });
            if st.session.phase.is_terminal() {
                return Ok(PhaseStep::Finished);
            }
            st.transition(SessionPhase::Completed, "Consolidation transferred")?;
            let profit: Decimal = st.units.iter().map(|u| u.profit).sum();
            st.session.status = SessionStatus::info(format!(
                "Completed: {} units collected, profit {}, consolidated {} to {} ({})",
                st.session.unit_count, profit, receipt.amount, destination, receipt.correlation_ref
            ));
        }
        self.finish(handle).await?;
        Ok(PhaseStep::Finished)
    }

    /// Ask the recovery manager what to do with a failed phase and act on it.
    /// `extra_error` counts a failure that is not tied to a unit.
    async fn handle_failure(
        &self,
        handle: &SessionHandle,
        critical: Option<ErrorKind>,
        extra_error: Option<ErrorKind>,
    ) -> Result<PhaseStep> {
        let has_checkpoint = match self.inner.store.latest_checkpoint(handle.id()).await {
            Ok(checkpoint) => checkpoint.is_some(),
            Err(e) => {
                warn!(session_id = %handle.id(), error = %e, "Checkpoint lookup failed");
                false
            }
        };

        let ctx = {
            let st = handle.lock();
            if st.session.phase.is_terminal() {
                return Ok(PhaseStep::Finished);
            }
            let mut errors = st.metrics.failing_by_kind(&st.units);
            if let Some(kind) = extra_error {
                *errors.entry(kind).or_insert(0) += 1;
            }
            FailureContext {
                critical,
                stopped: false,
                progress: st.session.progress,
                failure_rate: st.metrics.failure_rate(),
                errors,
                recovery_attempts: st.session.recovery_attempts,
                has_checkpoint,
            }
        };

        let decision = self.inner.recovery.decide(&ctx);
        handle.lock().session.decisions.push(decision.clone());

        match decision.action {
            RecoveryAction::SessionRecovery => self.recover(handle, &decision).await,
            RecoveryAction::Refund => {
                self.conclude_with_refund(handle, &decision).await?;
                Ok(PhaseStep::Finished)
            }
            RecoveryAction::ManualIntervention | RecoveryAction::Retry { .. } => {
                self.escalate(handle, &decision, None).await;
                let kind = decision.error_kind.unwrap_or(ErrorKind::Unknown);
                self.fail(
                    handle,
                    kind,
                    format!("Manual intervention required: {}", decision.reason),
                )
                .await?;
                Ok(PhaseStep::Finished)
            }
        }
    }

    /// Back off, checkpoint, and re-run the current phase. Unit flags only
    /// move forward, so the re-run picks up exactly the units the last
    /// checkpoint still lists as pending or failed.
    async fn recover(
        &self,
        handle: &SessionHandle,
        decision: &RecoveryDecision,
    ) -> Result<PhaseStep> {
        let (attempt, phase, progress) = {
            let mut st = handle.lock();
            if st.session.phase.is_terminal() {
                return Ok(PhaseStep::Finished);
            }
            st.session.recovery_attempts += 1;
            st.session.status = SessionStatus::info(format!(
                "Session recovery {}/{}: {}",
                st.session.recovery_attempts,
                self.inner.recovery.config().max_recovery_attempts,
                decision.reason
            ));
            (
                st.session.recovery_attempts,
                st.session.phase,
                st.session.progress,
            )
        };
        self.inner.metrics.session_recovery();
        warn!(session_id = %handle.id(), attempt, %phase, "Starting session recovery");
        self.emit(
            SessionEvent::new(EventType::RecoveryStarted, handle.id())
                .with_phase(phase)
                .with_progress(progress)
                .with_message(decision.reason.clone()),
        )
        .await;

        let delay = self.inner.recovery.retry_policy().delay_for(attempt);
        tokio::select! {
            _ = handle.cancel_token().cancelled() => return Ok(PhaseStep::Finished),
            _ = tokio::time::sleep(delay) => {}
        }

        self.checkpoint(handle, format!("session recovery attempt {}", attempt))
            .await?;
        Ok(PhaseStep::Retry)
    }

    async fn conclude_with_refund(
        &self,
        handle: &SessionHandle,
        decision: &RecoveryDecision,
    ) -> Result<()> {
        let kind = decision.error_kind.unwrap_or(ErrorKind::Unknown);
        let summary = self.settle_refund(handle, decision).await;
        self.fail(handle, kind, format!("{}; {}", decision.reason, summary))
            .await
    }

    /// Settle a session whose driver hit an internal error.
    async fn abort(&self, handle: &SessionHandle, cause: PilotError) -> Result<()> {
        if handle.phase().is_terminal() {
            return Ok(());
        }
        let decision = self.inner.recovery.decide(&FailureContext {
            critical: Some(ErrorKind::CriticalSystemError),
            progress: handle.lock().session.progress,
            ..Default::default()
        });
        let decision = RecoveryDecision {
            reason: format!("{}: {}", decision.reason, cause),
            ..decision
        };
        let attempted = {
            let mut st = handle.lock();
            st.session.decisions.push(decision.clone());
            st.session.refund.clone()
        };
        // A refund already attempted by this driver is escalated, never re-sent.
        if let Some(record) = attempted {
            let summary = format!("refund {} earlier: {}", record.status, record.shortfall());
            self.escalate(handle, &decision, Some(record)).await;
            return self
                .fail(
                    handle,
                    ErrorKind::CriticalSystemError,
                    format!("{}; {}", decision.reason, summary),
                )
                .await;
        }
        self.conclude_with_refund(handle, &decision).await
    }
}
