//! Shared harness: a controller wired to simulated backends and an in-memory store.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fanout_pilot::config::PilotConfig;
use fanout_pilot::error::{PilotError, Result};
use fanout_pilot::external::{SimulatedBackends, SimulatedRouter};
use fanout_pilot::metrics::SessionReport;
use fanout_pilot::notification::Notifier;
use fanout_pilot::recovery::{Checkpoint, RefundRecord, RefundStatus};
use fanout_pilot::session::{
    Backends, PaymentReceipt, SessionController, SessionId, SessionRequest, SessionStatusView,
    UnitBatch,
};
use fanout_pilot::storage::{MemoryStore, SessionStore};

pub const PAYER: &str = "payer";

/// Small windows and near-zero backoff so paused-clock tests finish quickly.
pub fn fast_config() -> PilotConfig {
    let mut config = PilotConfig::default();
    config.session.total = dec!(0.30);
    config.session.unit_count = 10;
    config.session.activation_window_secs = 10;
    config.session.collection_window_secs = 5;
    config.execution.max_retries = 2;
    config.execution.retry_base_delay_ms = 1;
    config.execution.retry_max_delay_ms = 10;
    config.execution.call_timeout_secs = 5;
    config.execution.max_concurrent_units = 4;
    config.notification.enabled = false;
    config
}

pub struct Harness {
    pub controller: SessionController,
    pub sim: SimulatedBackends,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config(), |router| router.with_yield(dec!(0.05)))
    }

    pub fn with_config(
        config: PilotConfig,
        configure: impl FnOnce(SimulatedRouter) -> SimulatedRouter,
    ) -> Self {
        Self::with_notifier(config, configure, Notifier::disabled())
    }

    pub fn with_notifier(
        config: PilotConfig,
        configure: impl FnOnce(SimulatedRouter) -> SimulatedRouter,
        notifier: Notifier,
    ) -> Self {
        Self::build(config, configure, notifier, |store| store)
    }

    /// Harness whose refund write with `status` fails once.
    pub fn with_flaky_refunds(config: PilotConfig, status: RefundStatus) -> Self {
        Self::build(
            config,
            |router| router.with_yield(dec!(0.05)),
            Notifier::disabled(),
            |store| Arc::new(FlakyRefundStore::new(store, status)),
        )
    }

    fn build(
        config: PilotConfig,
        configure: impl FnOnce(SimulatedRouter) -> SimulatedRouter,
        notifier: Notifier,
        wrap: impl FnOnce(Arc<dyn SessionStore>) -> Arc<dyn SessionStore>,
    ) -> Self {
        let sim = SimulatedBackends::new(config.accounts.operating_account.clone(), configure);
        let store = Arc::new(MemoryStore::new());
        let controller = SessionController::new(
            config,
            Backends::from(&sim),
            wrap(Arc::clone(&store) as Arc<dyn SessionStore>),
            notifier,
        )
        .expect("valid config");
        Self {
            controller,
            sim,
            store,
        }
    }

    /// Extra operating balance so refunds of the full payment succeed after
    /// part of it has been distributed.
    pub fn with_reserve(self, amount: Decimal) -> Self {
        self.sim
            .ledger
            .credit(self.sim.operating_account(), amount);
        self
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest::from_defaults(&self.controller.config().session, PAYER)
    }

    /// Create a session and confirm a real payment for it, without starting.
    pub async fn create_paid(&self, request: SessionRequest) -> SessionId {
        let total = request.total;
        let id = self
            .controller
            .create_session(request)
            .await
            .expect("create session");
        let receipt = self.sim.pay_in(PAYER, total).await.expect("pay in");
        self.controller
            .confirm_payment(&id, PaymentReceipt::new(receipt.correlation_ref, PAYER, total))
            .await
            .expect("confirm payment");
        id
    }

    pub async fn start(&self, request: SessionRequest) -> SessionId {
        let id = self.create_paid(request).await;
        self.controller
            .start_session(&id)
            .await
            .expect("start session");
        id
    }

    /// Poll until progress reaches `threshold` or the session ends.
    pub async fn wait_for_progress(&self, id: &SessionId, threshold: f64) -> SessionStatusView {
        loop {
            let view = self
                .controller
                .get_session_status(id)
                .await
                .expect("status");
            if view.progress >= threshold || view.phase.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Transfers from the operating account back to the payer.
    pub fn payer_refunds(&self) -> Vec<Decimal> {
        self.sim
            .ledger
            .transfers()
            .into_iter()
            .filter(|t| t.to == PAYER)
            .map(|t| t.amount)
            .collect()
    }
}

/// Store whose first refund write with a given status fails.
pub struct FlakyRefundStore {
    inner: Arc<dyn SessionStore>,
    fail_on: RefundStatus,
    armed: AtomicBool,
}

impl FlakyRefundStore {
    pub fn new(inner: Arc<dyn SessionStore>, fail_on: RefundStatus) -> Self {
        Self {
            inner,
            fail_on,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl SessionStore for FlakyRefundStore {
    async fn save_batch(&self, batch: &UnitBatch) -> Result<()> {
        self.inner.save_batch(batch).await
    }

    async fn load_batch(&self, session_id: &SessionId) -> Result<UnitBatch> {
        self.inner.load_batch(session_id).await
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.append_checkpoint(checkpoint).await
    }

    async fn latest_checkpoint(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        self.inner.latest_checkpoint(session_id).await
    }

    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints(session_id).await
    }

    async fn find_refund(&self, session_id: &SessionId) -> Result<Option<RefundRecord>> {
        self.inner.find_refund(session_id).await
    }

    async fn record_refund(&self, record: &RefundRecord) -> Result<()> {
        if record.status == self.fail_on && self.armed.swap(false, Ordering::SeqCst) {
            return Err(PilotError::Persistence("refund store unavailable".into()));
        }
        self.inner.record_refund(record).await
    }

    async fn save_report(&self, report: &SessionReport) -> Result<()> {
        self.inner.save_report(report).await
    }

    async fn load_report(&self, session_id: &SessionId) -> Result<SessionReport> {
        self.inner.load_report(session_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        self.inner.list_sessions().await
    }
}

/// Handle the controller assigns to unit `index` of session `id`.
pub fn unit_handle(id: &SessionId, index: usize) -> String {
    format!("{}-u{:03}", id, index)
}
