use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::model::{
    AllocationUnit, PaymentReceipt, Session, SessionId, SessionRequest, SessionStatus,
    SessionStatusView, UnitBatch,
};
use super::phase::SessionPhase;
use super::registry::{SessionHandle, SessionRegistry, SessionState};
use crate::allocation::{AllocationGenerator, ScheduleGenerator};
use crate::config::PilotConfig;
use crate::error::{ErrorKind, PilotError, Result};
use crate::execution::UnitExecutor;
use crate::external::{Ledger, Router, Signer, SimulatedBackends};
use crate::metrics::{
    MetricsView, PilotMetrics, PilotMetricsSnapshot, RefundSummary, SessionMetrics, SessionReport,
};
use crate::notification::{EventType, Notifier, SessionEvent};
use crate::recovery::{
    Checkpoint, EscalationContext, FailureContext, OperatorAction, RecoveryAction,
    RecoveryDecision, RecoveryManager, RefundManager, RefundRecord, RefundRequest, RetryPolicy,
};
use crate::storage::SessionStore;

/// External collaborators a controller drives.
#[derive(Clone)]
pub struct Backends {
    pub router: Arc<dyn Router>,
    pub signer: Arc<dyn Signer>,
    pub ledger: Arc<dyn Ledger>,
}

impl From<&SimulatedBackends> for Backends {
    fn from(sim: &SimulatedBackends) -> Self {
        Self {
            router: sim.router.clone(),
            signer: sim.signer.clone(),
            ledger: sim.ledger.clone(),
        }
    }
}

/// Owns every live session: creation, payment, start, stop, resume, status
/// and reports. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionController {
    pub(super) inner: Arc<ControllerInner>,
}

pub(super) struct ControllerInner {
    pub(super) config: PilotConfig,
    pub(super) registry: SessionRegistry,
    pub(super) store: Arc<dyn SessionStore>,
    pub(super) executor: Arc<UnitExecutor>,
    pub(super) recovery: Arc<RecoveryManager>,
    pub(super) refunds: RefundManager,
    pub(super) signer: Arc<dyn Signer>,
    pub(super) notifier: Notifier,
    pub(super) metrics: Arc<PilotMetrics>,
    allocation: AllocationGenerator,
    schedule: ScheduleGenerator,
}

impl SessionController {
    pub fn new(
        config: PilotConfig,
        backends: Backends,
        store: Arc<dyn SessionStore>,
        notifier: Notifier,
    ) -> Result<Self> {
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.execution);
        let recovery = Arc::new(RecoveryManager::new(config.recovery.clone(), retry));
        let operating = config.accounts.operating_account.clone();

        let call_timeout = Duration::from_secs(config.execution.call_timeout_secs);
        let executor = Arc::new(UnitExecutor::new(
            backends.router,
            Arc::clone(&backends.signer),
            Arc::clone(&backends.ledger),
            Arc::clone(&recovery),
            operating.clone(),
            call_timeout,
        ));
        let refunds = RefundManager::new(
            backends.ledger,
            Arc::clone(&backends.signer),
            Arc::clone(&store),
            retry,
            operating,
            call_timeout,
        );
        let allocation = AllocationGenerator::new(
            config.allocation.amount_precision,
            config.allocation.max_draw_attempts,
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                registry: SessionRegistry::new(),
                store,
                executor,
                recovery,
                refunds,
                signer: backends.signer,
                notifier,
                metrics: Arc::new(PilotMetrics::new()),
                allocation,
                schedule: ScheduleGenerator::new(),
            }),
        })
    }

    pub fn config(&self) -> &PilotConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> PilotMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Validate `request` and register a new session awaiting payment.
    /// Nothing is registered when validation fails.
    pub async fn create_session(&self, request: SessionRequest) -> Result<SessionId> {
        self.validate_request(&request)?;

        let id = SessionId::generate();
        let mut state = SessionState::new(
            Session::new(id.clone(), &request),
            Vec::new(),
            self.inner.config.metrics.recent_refs_capacity,
        );
        state.transition(SessionPhase::PaymentPending, "Session created")?;
        state.session.status = SessionStatus::info("Awaiting payment");

        let handle = Arc::new(SessionHandle::new(state));
        self.inner.registry.insert(Arc::clone(&handle))?;
        self.checkpoint(&handle, "session created").await?;
        self.inner.metrics.session_created();

        info!(
            session_id = %id,
            total = %request.total,
            units = request.unit_count,
            "Session created"
        );
        self.emit(
            SessionEvent::new(EventType::SessionCreated, &id)
                .with_phase(SessionPhase::PaymentPending),
        )
        .await;
        Ok(id)
    }

    fn validate_request(&self, request: &SessionRequest) -> Result<()> {
        if request.unit_count == 0 {
            return Err(PilotError::InvalidAllocationConfig(
                "unit count must be positive".into(),
            ));
        }
        if request.activation_window_secs == 0 || request.collection_window_secs == 0 {
            return Err(PilotError::InvalidAllocationConfig(
                "activation and collection windows must be positive".into(),
            ));
        }
        if request.payer_account.trim().is_empty() {
            return Err(PilotError::InvalidAllocationConfig(
                "payer account is required".into(),
            ));
        }
        if let Some(target) = request.profit_target
            && target < Decimal::ZERO
        {
            return Err(PilotError::InvalidAllocationConfig(format!(
                "profit target {} is negative",
                target
            )));
        }
        self.inner
            .allocation
            .validate(request.total, request.unit_count, request.bounds)
    }

    /// Record the externally confirmed upfront payment.
    pub async fn confirm_payment(&self, id: &SessionId, receipt: PaymentReceipt) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let mut st = handle.lock();
            expect_phase(&st, SessionPhase::PaymentPending, SessionPhase::Created)?;
            st.session.status =
                SessionStatus::info(format!("Payment {} confirmed", receipt.reference));
            st.session.payment = Some(receipt.clone());
            st.session.touch();
        }
        self.checkpoint(&handle, "payment confirmed").await?;

        info!(
            session_id = %id,
            reference = receipt.reference,
            amount = %receipt.amount,
            "Payment confirmed"
        );
        self.emit(
            SessionEvent::new(EventType::PaymentConfirmed, id)
                .with_message(format!("{} from {}", receipt.amount, receipt.payer_account)),
        )
        .await;
        Ok(())
    }

    /// Verify payment, generate and persist the unit batch, then begin
    /// distribution in the background.
    pub async fn start_session(&self, id: &SessionId) -> Result<()> {
        let handle = self.handle(id)?;
        let (session, payment) = {
            let st = handle.lock();
            expect_phase(&st, SessionPhase::PaymentPending, SessionPhase::Created)?;
            (st.session.clone(), st.session.payment.clone())
        };

        if let Err(reason) = self.verify_payment(payment.as_ref(), session.total).await {
            warn!(session_id = %id, reason, "Payment verification failed");
            self.fail(&handle, ErrorKind::PaymentFailed, format!("Payment failed: {}", reason))
                .await?;
            return Err(PilotError::PaymentFailed {
                session_id: id.to_string(),
                reason,
            });
        }

        let seed: u64 = rand::thread_rng().r#gen();
        let units = match self.generate_units(&session, seed) {
            Ok(units) => units,
            Err(e) => {
                self.fail(&handle, ErrorKind::InvalidConfig, e.to_string()).await?;
                return Err(e);
            }
        };

        self.inner
            .store
            .save_batch(&UnitBatch {
                session_id: id.clone(),
                rng_seed: seed,
                created_at: Utc::now(),
                units: units.clone(),
            })
            .await?;

        {
            let mut st = handle.lock();
            st.transition(SessionPhase::Created, "Payment verified, units generated")?;
            st.session.rng_seed = seed;
            st.session.status = SessionStatus::info(format!("{} units generated", units.len()));
            st.metrics =
                SessionMetrics::new(units.len(), self.inner.config.metrics.recent_refs_capacity);
            st.units = units;
        }
        handle.publish_phase(SessionPhase::Created);
        self.checkpoint(&handle, "units generated").await?;

        {
            let mut st = handle.lock();
            st.transition(SessionPhase::Distributing, "Distribution started")?;
            st.session.status = SessionStatus::info(format!(
                "Distributing {} units over {}s",
                st.session.unit_count, st.session.activation_window_secs
            ));
        }
        handle.publish_phase(SessionPhase::Distributing);
        self.checkpoint(&handle, "distribution started").await?;

        self.inner.metrics.session_started();
        info!(session_id = %id, seed, "Session started");
        self.emit(
            SessionEvent::new(EventType::SessionStarted, id).with_phase(SessionPhase::Distributing),
        )
        .await;

        self.spawn_driver(&handle);
        Ok(())
    }

    async fn verify_payment(
        &self,
        payment: Option<&PaymentReceipt>,
        total: Decimal,
    ) -> std::result::Result<(), String> {
        let Some(payment) = payment else {
            return Err("no payment confirmed".to_string());
        };
        if payment.amount < total {
            return Err(format!(
                "payment {} is below the session total {}",
                payment.amount, total
            ));
        }
        if !self.inner.signer.is_connected().await {
            return Err("signer is disconnected".to_string());
        }
        Ok(())
    }

    /// Amounts, then activation and collection offsets, each assigned
    /// through its own permutation of the unit indices.
    fn generate_units(&self, session: &Session, seed: u64) -> Result<Vec<AllocationUnit>> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let n = session.unit_count;

        let amounts =
            self.inner
                .allocation
                .generate(session.total, n, session.bounds, &mut rng)?;
        let activation =
            self.inner
                .schedule
                .generate(n, session.activation_window(), &mut rng)?;
        let collection =
            self.inner
                .schedule
                .generate(n, session.collection_window(), &mut rng)?;

        let mut activation_order: Vec<usize> = (0..n).collect();
        activation_order.shuffle(&mut rng);
        let mut collection_order: Vec<usize> = (0..n).collect();
        collection_order.shuffle(&mut rng);

        Ok(amounts
            .into_iter()
            .enumerate()
            .map(|(i, amount)| {
                AllocationUnit::new(
                    i,
                    format!("{}-u{:03}", session.id, i),
                    amount,
                    activation[activation_order[i]],
                    collection[collection_order[i]],
                )
            })
            .collect())
    }

    /// Cancel the session, freeze its unit flags, and settle the refund
    /// question from the progress at the moment of the stop.
    pub async fn stop_session(&self, id: &SessionId) -> Result<()> {
        let handle = self.handle(id)?;
        let progress = {
            let mut st = handle.lock();
            st.transition(SessionPhase::Stopped, "Stop requested")?;
            handle.cancel_token().cancel();
            st.session.status = SessionStatus::info(format!(
                "Stopped at {:.1}% progress",
                st.session.progress
            ));
            st.session.progress
        };
        info!(session_id = %id, progress, "Session stop requested");

        // In-flight executions drain before the refund decision runs.
        if let Some(driver) = handle.take_driver()
            && let Err(e) = driver.await
        {
            warn!(session_id = %id, error = %e, "Session driver ended abnormally");
        }

        let decision = self.inner.recovery.decide(&FailureContext {
            stopped: true,
            progress,
            ..Default::default()
        });
        handle.lock().session.decisions.push(decision.clone());

        let summary = match decision.action {
            RecoveryAction::Refund => self.settle_refund(&handle, &decision).await,
            _ => {
                self.escalate(&handle, &decision, None).await;
                "manual intervention required".to_string()
            }
        };

        {
            let mut st = handle.lock();
            st.session.status =
                SessionStatus::info(format!("Stopped at {:.1}% progress; {}", progress, summary));
            st.session.touch();
        }
        self.finish(&handle).await
    }

    pub async fn get_session_status(&self, id: &SessionId) -> Result<SessionStatusView> {
        if let Some(handle) = self.inner.registry.get(id) {
            return Ok(handle.lock().status_view());
        }
        let checkpoint = self
            .inner
            .store
            .latest_checkpoint(id)
            .await?
            .ok_or_else(|| PilotError::SessionNotFound(id.to_string()))?;
        let counts = checkpoint.unit_counts();
        let session = checkpoint.session;
        Ok(SessionStatusView {
            session_id: session.id,
            phase: session.phase,
            progress: session.progress,
            counts,
            status: session.status,
            refund: session.refund,
            updated_at: session.updated_at,
        })
    }

    /// Live report for registered sessions, otherwise the archived one.
    pub async fn get_session_report(&self, id: &SessionId) -> Result<SessionReport> {
        if let Some(handle) = self.inner.registry.get(id) {
            let st = handle.lock();
            return Ok(SessionReport::build(&st.session, &st.units));
        }
        match self.inner.store.load_report(id).await {
            Ok(report) => Ok(report),
            Err(PilotError::ReportNotFound(_)) => {
                let (session, units) = self.load_snapshot(id).await?;
                Ok(SessionReport::build(&session, &units))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn export_session_report(&self, id: &SessionId) -> Result<String> {
        self.get_session_report(id).await?.to_json()
    }

    /// Per-session live counters; `None` once the session is archived.
    pub fn session_metrics(&self, id: &SessionId) -> Option<MetricsView> {
        self.inner
            .registry
            .get(id)
            .map(|h| h.lock().metrics.snapshot())
    }

    /// Re-enter a session from its latest checkpoint, e.g. after a restart.
    pub async fn resume_session(&self, id: &SessionId) -> Result<()> {
        if let Some(existing) = self.inner.registry.get(id)
            && !existing.phase().is_terminal()
        {
            return Err(PilotError::SessionAlreadyRunning(id.to_string()));
        }

        let checkpoint = self
            .inner
            .store
            .latest_checkpoint(id)
            .await?
            .ok_or_else(|| PilotError::CheckpointNotFound(id.to_string()))?;
        if checkpoint.phase.is_terminal() {
            return Err(PilotError::Recovery(format!(
                "session {} already ended as {}",
                id, checkpoint.phase
            )));
        }

        let units = match checkpoint.phase {
            SessionPhase::Initializing | SessionPhase::PaymentPending => Vec::new(),
            _ => {
                let batch = self.inner.store.load_batch(id).await?;
                checkpoint.restore_units(&batch)?
            }
        };

        let mut state = SessionState::new(
            checkpoint.session.clone(),
            units,
            self.inner.config.metrics.recent_refs_capacity,
        );
        state.session.status =
            SessionStatus::info(format!("Resumed from checkpoint {}", checkpoint.id));
        if state.session.phase == SessionPhase::Created {
            state.transition(SessionPhase::Distributing, "Resumed before distribution")?;
        }
        let phase = state.session.phase;

        let handle = Arc::new(SessionHandle::new(state));
        self.inner.registry.insert(Arc::clone(&handle))?;
        self.checkpoint(&handle, format!("resumed from {}", checkpoint.id))
            .await?;

        info!(session_id = %id, checkpoint = checkpoint.id, %phase, "Session resumed");
        self.emit(
            SessionEvent::new(EventType::SessionStarted, id)
                .with_phase(phase)
                .with_message(format!("resumed from {}", checkpoint.id)),
        )
        .await;

        if phase.is_running() {
            self.spawn_driver(&handle);
        }
        Ok(())
    }

    /// Re-run the refund for an ended session whose refund is on record.
    /// A completed refund is reported as-is without a second transfer.
    pub async fn retry_refund(&self, id: &SessionId) -> Result<RefundRecord> {
        if let Some(handle) = self.inner.registry.get(id)
            && !handle.phase().is_terminal()
        {
            return Err(PilotError::RefundFailed {
                session_id: id.to_string(),
                reason: "session is still running".into(),
            });
        }

        let checkpoint = self
            .inner
            .store
            .latest_checkpoint(id)
            .await?
            .ok_or_else(|| PilotError::SessionNotFound(id.to_string()))?;
        let request = match self.inner.refunds.find(id).await? {
            Some(previous) if previous.is_pending() => {
                return Err(PilotError::RefundFailed {
                    session_id: id.to_string(),
                    reason: "refund transfer outcome unknown; reconcile the ledger".into(),
                });
            }
            Some(previous) => RefundRequest {
                session_id: id.clone(),
                payer_account: previous.payer_account,
                amount: previous.amount,
                reason: previous.reason,
            },
            None => {
                let session = &checkpoint.session;
                let decided = session
                    .decisions
                    .last()
                    .filter(|d| d.action == RecoveryAction::Refund);
                match (decided, &session.payment) {
                    (Some(decision), Some(payment)) => RefundRequest {
                        session_id: id.clone(),
                        payer_account: payment.payer_account.clone(),
                        amount: payment.amount,
                        reason: decision.reason.clone(),
                    },
                    _ => {
                        return Err(PilotError::RefundFailed {
                            session_id: id.to_string(),
                            reason: "no refund on record".into(),
                        });
                    }
                }
            }
        };

        let outcome = self.inner.refunds.refund(request).await?;
        let record = outcome.record;
        if outcome.already_recorded {
            return Ok(record);
        }
        self.inner.metrics.refund(record.is_completed());
        self.emit(refund_event(&record)).await;

        let mut session = checkpoint.session.clone();
        session.refund = Some(record.clone());
        if let Some(escalation) = session.escalation.as_mut() {
            escalation.refund = Some(record.clone());
        }
        session.touch();
        self.inner
            .store
            .append_checkpoint(&checkpoint.amend(session, "refund retried"))
            .await?;

        if let Ok(mut report) = self.inner.store.load_report(id).await {
            report.summary.refund = RefundSummary::from_record(Some(&record));
            self.inner.store.save_report(&report).await?;
        }

        if !record.is_completed() {
            return Err(PilotError::RefundFailed {
                session_id: id.to_string(),
                reason: record.shortfall(),
            });
        }
        Ok(record)
    }

    /// Block until the session reaches a terminal phase.
    pub async fn wait_for_terminal(&self, id: &SessionId) -> Result<SessionPhase> {
        let Some(handle) = self.inner.registry.get(id) else {
            return Ok(self.get_session_status(id).await?.phase);
        };
        let mut rx = handle.subscribe();
        let phase = match rx.wait_for(|p| p.is_terminal()).await {
            Ok(phase) => *phase,
            Err(_) => handle.phase(),
        };
        Ok(phase)
    }

    /// Sessions known to this controller or to the store.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids = self.inner.store.list_sessions().await?;
        ids.extend(self.inner.registry.ids());
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    pub async fn list_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        self.inner.store.list_checkpoints(id).await
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| PilotError::SessionNotFound(id.to_string()))
    }

    async fn load_snapshot(&self, id: &SessionId) -> Result<(Session, Vec<AllocationUnit>)> {
        let checkpoint = self
            .inner
            .store
            .latest_checkpoint(id)
            .await?
            .ok_or_else(|| PilotError::SessionNotFound(id.to_string()))?;
        let units = if checkpoint.unit_states.is_empty() {
            Vec::new()
        } else {
            let batch = self.inner.store.load_batch(id).await?;
            checkpoint.restore_units(&batch)?
        };
        Ok((checkpoint.session, units))
    }

    fn spawn_driver(&self, handle: &Arc<SessionHandle>) {
        let controller = self.clone();
        let driven = Arc::clone(handle);
        handle.set_driver(tokio::spawn(async move { controller.drive(driven).await }));
    }

    pub(super) async fn checkpoint(
        &self,
        handle: &SessionHandle,
        reason: impl Into<String>,
    ) -> Result<()> {
        let checkpoint = {
            let mut st = handle.lock();
            st.session.checkpoint_seq += 1;
            Checkpoint::capture(&st.session, &st.units, st.session.checkpoint_seq, reason)
        };
        self.inner.store.append_checkpoint(&checkpoint).await?;
        info!(
            session_id = %checkpoint.session_id,
            checkpoint = checkpoint.id,
            progress = checkpoint.progress,
            "Checkpoint written"
        );
        Ok(())
    }

    pub(super) async fn emit(&self, event: SessionEvent) {
        self.inner.notifier.notify(&event).await;
    }

    /// Refund the session's payment, if any, and record the outcome on the
    /// session.
    pub(super) async fn issue_refund(
        &self,
        handle: &SessionHandle,
        reason: &str,
    ) -> Result<Option<RefundRecord>> {
        let Some(payment) = handle.lock().session.payment.clone() else {
            debug!(session_id = %handle.id(), "No payment on record; nothing to refund");
            return Ok(None);
        };

        let outcome = self
            .inner
            .refunds
            .refund(RefundRequest {
                session_id: handle.id().clone(),
                payer_account: payment.payer_account,
                amount: payment.amount,
                reason: reason.to_string(),
            })
            .await?;
        let record = outcome.record;
        if !outcome.already_recorded {
            self.inner.metrics.refund(record.is_completed());
            self.emit(refund_event(&record)).await;
        }

        {
            let mut st = handle.lock();
            st.session.refund = Some(record.clone());
            st.session.touch();
        }
        Ok(Some(record))
    }

    /// Refund the payment and escalate whatever did not complete. Returns a
    /// one-line summary for the session status.
    ///
    /// A refund call that errors is tried once more. The stored record makes
    /// that safe: a transfer whose outcome was never written stays `Pending`
    /// and is not sent again.
    pub(super) async fn settle_refund(
        &self,
        handle: &SessionHandle,
        decision: &RecoveryDecision,
    ) -> String {
        let result = match self.issue_refund(handle, &decision.reason).await {
            Err(e) => {
                warn!(session_id = %handle.id(), error = %e, "Refund call failed; checking again");
                self.issue_refund(handle, &decision.reason).await
            }
            settled => settled,
        };
        match result {
            Ok(Some(record)) if record.is_completed() => {
                format!("refunded {} to {}", record.amount, record.payer_account)
            }
            Ok(Some(record)) => {
                let summary = format!(
                    "refund of {} not completed: {}",
                    record.amount,
                    record.shortfall()
                );
                self.escalate(handle, decision, Some(record)).await;
                summary
            }
            Ok(None) => "no payment to refund".to_string(),
            Err(e) => {
                error!(session_id = %handle.id(), error = %e, "Refund not settled");
                self.escalate(handle, decision, None).await;
                if let Some(ctx) = handle.lock().session.escalation.as_mut() {
                    ctx.add_action(OperatorAction::RetryRefund);
                }
                format!("refund not settled: {}", e)
            }
        }
    }

    /// Attach an escalation context to the session and surface it.
    pub(super) async fn escalate(
        &self,
        handle: &SessionHandle,
        decision: &RecoveryDecision,
        refund: Option<RefundRecord>,
    ) {
        let escalation = {
            let mut st = handle.lock();
            let mut ctx = EscalationContext::new(
                st.session.id.clone(),
                st.session.phase,
                st.session.progress,
                decision.reason.clone(),
            )
            .with_decision(decision.clone())
            .with_units(&st.units);
            if let Some(record) = refund {
                ctx = ctx.with_refund(record);
            }
            if decision.error_kind == Some(ErrorKind::SignerDisconnected) {
                ctx.add_action(OperatorAction::ReconnectSigner);
            }
            st.session.escalation = Some(ctx.clone());
            ctx
        };

        escalation.log();
        self.inner.metrics.escalation();
        self.emit(
            SessionEvent::new(EventType::Escalated, handle.id())
                .with_phase(escalation.phase)
                .with_progress(escalation.progress)
                .with_message(escalation.summary.clone()),
        )
        .await;
    }

    /// Move to `Failed` unless the session already ended (a concurrent stop
    /// wins), then archive.
    pub(super) async fn fail(
        &self,
        handle: &SessionHandle,
        kind: ErrorKind,
        message: String,
    ) -> Result<()> {
        {
            let mut st = handle.lock();
            if st.session.phase.is_terminal() {
                debug!(session_id = %handle.id(), "Session already ended; not failing");
                return Ok(());
            }
            st.transition(SessionPhase::Failed, message.clone())?;
            st.session.status = SessionStatus::error(kind, message);
        }
        self.finish(handle).await
    }

    /// Archive a terminal session: final checkpoint, report, counters,
    /// event, then unregister and wake waiters.
    pub(super) async fn finish(&self, handle: &SessionHandle) -> Result<()> {
        let (phase, progress, message, report) = {
            let st = handle.lock();
            (
                st.session.phase,
                st.session.progress,
                st.session.status.message.clone(),
                SessionReport::build(&st.session, &st.units),
            )
        };

        let archived = async {
            self.checkpoint(handle, format!("session {}", phase.as_str()))
                .await?;
            self.inner.store.save_report(&report).await
        }
        .await;

        let event_type = match phase {
            SessionPhase::Completed => {
                self.inner.metrics.session_completed();
                EventType::SessionCompleted
            }
            SessionPhase::Stopped => {
                self.inner.metrics.session_stopped();
                EventType::SessionStopped
            }
            _ => {
                self.inner.metrics.session_failed();
                EventType::SessionFailed
            }
        };
        info!(session_id = %handle.id(), %phase, progress, status = message, "Session ended");
        self.emit(
            SessionEvent::new(event_type, handle.id())
                .with_phase(phase)
                .with_progress(progress)
                .with_message(message),
        )
        .await;

        self.inner.registry.remove(handle.id());
        handle.publish_phase(phase);
        archived
    }
}

fn expect_phase(st: &SessionState, expected: SessionPhase, next: SessionPhase) -> Result<()> {
    let current = st.session.phase;
    if current != expected {
        return Err(PilotError::InvalidStateTransition {
            from: current.to_string(),
            to: next.to_string(),
            allowed: current
                .allowed_transitions()
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    Ok(())
}

fn refund_event(record: &RefundRecord) -> SessionEvent {
    let event_type = if record.is_completed() {
        EventType::RefundIssued
    } else {
        EventType::RefundFailed
    };
    let message = match (&record.correlation_ref, &record.error) {
        (Some(r), _) => format!("{} to {} ({})", record.amount, record.payer_account, r),
        (None, Some(e)) => format!("{} to {}: {}", record.amount, record.payer_account, e),
        (None, None) => format!("{} to {}", record.amount, record.payer_account),
    };
    SessionEvent::new(event_type, &record.session_id).with_message(message)
}
