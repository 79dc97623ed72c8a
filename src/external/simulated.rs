//! In-process collaborators used by the `run` command and by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rust_decimal::Decimal;

use super::{Execution, Ledger, Quote, Router, Signer, TransferReceipt};
use crate::error::ExecutionError;

/// Scripted outcome for the next execution touching an account.
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed,
    Fail(ExecutionError),
    /// Fails every execution for the account; never consumed.
    FailAlways(ExecutionError),
}

pub struct SimulatedSigner {
    connected: AtomicBool,
    /// Signatures left before the signer drops; `usize::MAX` disables the countdown.
    remaining_before_disconnect: AtomicUsize,
}

impl Default for SimulatedSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSigner {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            remaining_before_disconnect: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.remaining_before_disconnect
            .store(usize::MAX, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Disconnect after `count` more successful signatures.
    pub fn disconnect_after(&self, count: usize) {
        self.remaining_before_disconnect
            .store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Signer for SimulatedSigner {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, ExecutionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ExecutionError::SignerDisconnected);
        }

        let remaining = self.remaining_before_disconnect.load(Ordering::SeqCst);
        if remaining != usize::MAX {
            if remaining == 0 {
                self.connected.store(false, Ordering::SeqCst);
                return Err(ExecutionError::SignerDisconnected);
            }
            self.remaining_before_disconnect
                .store(remaining - 1, Ordering::SeqCst);
        }

        let mut signed = b"sig:".to_vec();
        signed.extend_from_slice(payload);
        Ok(signed)
    }
}

/// Ledger transfer as recorded by `SimulatedLedger`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransfer {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub correlation_ref: String,
}

#[derive(Default)]
pub struct SimulatedLedger {
    balances: DashMap<String, Decimal>,
    transfers: Mutex<Vec<RecordedTransfer>>,
    rejection: Mutex<Option<String>>,
    next_ref: AtomicU64,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&self, account: &str, amount: Decimal) {
        *self.balances.entry(account.to_string()).or_default() += amount;
    }

    pub fn balance(&self, account: &str) -> Decimal {
        self.balances
            .get(account)
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn set_failing(&self, fail: bool) {
        if fail {
            self.reject_with("ledger rejected transfer");
        } else {
            *self.rejection.lock() = None;
        }
    }

    /// Reject every transfer with `message`, classified the way a real
    /// ledger's error text would be.
    pub fn reject_with(&self, message: impl Into<String>) {
        *self.rejection.lock() = Some(message.into());
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.transfers.lock().clone()
    }

    /// Move funds without a signer; used by the router to mirror executions.
    fn settle(&self, from: &str, to: &str, debit: Decimal, credit: Decimal) {
        *self.balances.entry(from.to_string()).or_default() -= debit;
        *self.balances.entry(to.to_string()).or_default() += credit;
    }

    fn next_ref(&self, prefix: &str) -> String {
        format!("{}-{:06}", prefix, self.next_ref.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn get_balance(&self, account: &str) -> Result<Decimal, ExecutionError> {
        Ok(self.balance(account))
    }

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        signer: &dyn Signer,
    ) -> Result<TransferReceipt, ExecutionError> {
        if let Some(message) = self.rejection.lock().as_deref() {
            return Err(ExecutionError::from_message(message));
        }
        let payload = format!("{}:{}:{}", from, to, amount);
        signer.sign(payload.as_bytes()).await?;

        let available = self.balance(from);
        if available < amount {
            return Err(ExecutionError::InsufficientFunds {
                required: amount.to_string(),
                available: available.to_string(),
            });
        }

        self.settle(from, to, amount, amount);
        let correlation_ref = self.next_ref("xfer");
        self.transfers.lock().push(RecordedTransfer {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            correlation_ref: correlation_ref.clone(),
        });
        Ok(TransferReceipt {
            correlation_ref,
            amount,
        })
    }
}

/// Router that settles executions instantly, with scripted and random failures.
///
/// Funds leaving `base_account` move at par; funds returning to it pick up
/// `yield_rate`. When linked to a `SimulatedLedger`, every execution is
/// mirrored as a balance move.
pub struct SimulatedRouter {
    base_account: String,
    yield_rate: Decimal,
    failure_rate: f64,
    latency: Duration,
    rng: Mutex<ChaCha20Rng>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    ledger: Option<Arc<SimulatedLedger>>,
    executions: AtomicUsize,
    next_ref: AtomicU64,
}

impl SimulatedRouter {
    pub fn new(base_account: impl Into<String>) -> Self {
        Self {
            base_account: base_account.into(),
            yield_rate: Decimal::ZERO,
            failure_rate: 0.0,
            latency: Duration::ZERO,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            scripts: Mutex::new(HashMap::new()),
            ledger: None,
            executions: AtomicUsize::new(0),
            next_ref: AtomicU64::new(0),
        }
    }

    pub fn with_yield(mut self, rate: Decimal) -> Self {
        self.yield_rate = rate;
        self
    }

    /// Probability (0.0-1.0) that an unscripted execution fails transiently.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = ChaCha20Rng::seed_from_u64(seed);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<SimulatedLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Queue outcomes for executions touching `account` (either side of the quote).
    pub fn script(&self, account: impl Into<String>, outcomes: impl IntoIterator<Item = Scripted>) {
        self.scripts
            .lock()
            .entry(account.into())
            .or_default()
            .extend(outcomes);
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn counterparty<'a>(&self, quote: &'a Quote) -> &'a str {
        if quote.from == self.base_account {
            &quote.to
        } else {
            &quote.from
        }
    }

    fn scripted_outcome(&self, account: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock();
        let queue = scripts.get_mut(account)?;
        match queue.front() {
            Some(Scripted::FailAlways(err)) => Some(Scripted::FailAlways(err.clone())),
            Some(_) => queue.pop_front(),
            None => None,
        }
    }
}

#[async_trait]
impl Router for SimulatedRouter {
    async fn quote(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<Quote, ExecutionError> {
        if amount <= Decimal::ZERO {
            return Err(ExecutionError::RouteUnavailable(format!(
                "non-positive amount {}",
                amount
            )));
        }
        let expected_out = if from == self.base_account {
            amount
        } else {
            amount * (Decimal::ONE + self.yield_rate)
        };
        Ok(Quote {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            expected_out,
            route: format!("{}->{}", from, to),
        })
    }

    async fn execute(
        &self,
        quote: &Quote,
        signer: &dyn Signer,
    ) -> Result<Execution, ExecutionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        match self.scripted_outcome(self.counterparty(quote)) {
            Some(Scripted::Fail(err)) | Some(Scripted::FailAlways(err)) => return Err(err),
            Some(Scripted::Succeed) => {}
            None => {
                let roll: f64 = self.rng.lock().r#gen();
                if roll < self.failure_rate {
                    return Err(ExecutionError::from_message(
                        "stale reference: quote expired before landing",
                    ));
                }
            }
        }

        signer.sign(quote.route.as_bytes()).await?;

        if let Some(ledger) = &self.ledger {
            ledger.settle(&quote.from, &quote.to, quote.amount, quote.expected_out);
        }

        let seq = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Execution {
            correlation_ref: format!("exec-{:06}", seq),
            realized_amount: quote.expected_out,
        })
    }
}

/// Signer, ledger and router wired to one operating account.
#[derive(Clone)]
pub struct SimulatedBackends {
    pub signer: Arc<SimulatedSigner>,
    pub ledger: Arc<SimulatedLedger>,
    pub router: Arc<SimulatedRouter>,
    operating_account: String,
}

impl SimulatedBackends {
    /// `configure` receives a router already linked to the shared ledger.
    pub fn new(
        operating_account: impl Into<String>,
        configure: impl FnOnce(SimulatedRouter) -> SimulatedRouter,
    ) -> Self {
        let operating_account = operating_account.into();
        let ledger = Arc::new(SimulatedLedger::new());
        let router = configure(
            SimulatedRouter::new(operating_account.clone()).with_ledger(Arc::clone(&ledger)),
        );
        Self {
            signer: Arc::new(SimulatedSigner::new()),
            ledger,
            router: Arc::new(router),
            operating_account,
        }
    }

    pub fn operating_account(&self) -> &str {
        &self.operating_account
    }

    /// Fund `payer` and move `amount` into the operating account, standing
    /// in for the user's upfront payment.
    pub async fn pay_in(
        &self,
        payer: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, ExecutionError> {
        self.ledger.credit(payer, amount);
        self.ledger
            .transfer(payer, &self.operating_account, amount, self.signer.as_ref())
            .await
    }
}
