use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::phase::{PhaseTransition, SessionPhase};
use crate::allocation::AmountBounds;
use crate::config::SessionDefaults;
use crate::error::ErrorKind;
use crate::recovery::{EscalationContext, RecoveryDecision, RefundRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("ses-{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two per-unit legs of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Activation,
    Collection,
}

impl UnitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::Collection => "collection",
        }
    }

    /// Session phase during which this leg runs.
    pub fn session_phase(&self) -> SessionPhase {
        match self {
            Self::Activation => SessionPhase::Distributing,
            Self::Collection => SessionPhase::Collecting,
        }
    }
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a session create request. Unset fields fall back to
/// `SessionDefaults`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub total: Decimal,
    pub unit_count: usize,
    pub activation_window_secs: u64,
    pub collection_window_secs: u64,
    pub bounds: AmountBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target: Option<Decimal>,
    pub payer_account: String,
    /// Consolidation target; defaults to the payer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account: Option<String>,
}

impl SessionRequest {
    pub fn from_defaults(defaults: &SessionDefaults, payer_account: impl Into<String>) -> Self {
        Self {
            total: defaults.total,
            unit_count: defaults.unit_count,
            activation_window_secs: defaults.activation_window_secs,
            collection_window_secs: defaults.collection_window_secs,
            bounds: AmountBounds::new(defaults.min_unit_amount, defaults.max_unit_amount),
            profit_target: defaults.profit_target,
            payer_account: payer_account.into(),
            destination_account: None,
        }
    }

    pub fn with_total(mut self, total: Decimal) -> Self {
        self.total = total;
        self
    }

    pub fn with_unit_count(mut self, count: usize) -> Self {
        self.unit_count = count;
        self
    }

    pub fn with_windows(mut self, activation_secs: u64, collection_secs: u64) -> Self {
        self.activation_window_secs = activation_secs;
        self.collection_window_secs = collection_secs;
        self
    }

    pub fn with_bounds(mut self, min: Decimal, max: Decimal) -> Self {
        self.bounds = AmountBounds::new(min, max);
        self
    }

    pub fn with_profit_target(mut self, target: Decimal) -> Self {
        self.profit_target = Some(target);
        self
    }

    pub fn with_destination(mut self, account: impl Into<String>) -> Self {
        self.destination_account = Some(account.into());
        self
    }
}

/// Externally confirmed upfront payment from the user to the operating account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub reference: String,
    pub payer_account: String,
    pub amount: Decimal,
    pub confirmed_at: DateTime<Utc>,
}

impl PaymentReceipt {
    pub fn new(reference: impl Into<String>, payer_account: impl Into<String>, amount: Decimal) -> Self {
        Self {
            reference: reference.into(),
            payer_account: payer_account.into(),
            amount,
            confirmed_at: Utc::now(),
        }
    }
}

/// Human-readable status line with its machine classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl SessionStatus {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_kind: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    pub correlation_ref: String,
    pub destination: String,
    pub amount: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub total: Decimal,
    pub unit_count: usize,
    pub activation_window_secs: u64,
    pub collection_window_secs: u64,
    pub bounds: AmountBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target: Option<Decimal>,
    pub payer_account: String,
    pub destination_account: String,

    pub phase: SessionPhase,
    pub progress: f64,
    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Anchor for the current phase's unit offsets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<Consolidation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationContext>,
    #[serde(default)]
    pub decisions: Vec<RecoveryDecision>,

    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub checkpoint_seq: u32,
    /// Seed of the session's private random stream.
    #[serde(default)]
    pub rng_seed: u64,

    #[serde(default)]
    pub history: Vec<PhaseTransition>,
}

impl Session {
    pub fn new(id: SessionId, request: &SessionRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            total: request.total,
            unit_count: request.unit_count,
            activation_window_secs: request.activation_window_secs,
            collection_window_secs: request.collection_window_secs,
            bounds: request.bounds,
            profit_target: request.profit_target,
            payer_account: request.payer_account.clone(),
            destination_account: request
                .destination_account
                .clone()
                .unwrap_or_else(|| request.payer_account.clone()),
            phase: SessionPhase::Initializing,
            progress: 0.0,
            status: SessionStatus::info("Session initializing"),
            created_at: now,
            updated_at: now,
            started_at: None,
            phase_started_at: None,
            finished_at: None,
            payment: None,
            consolidation: None,
            refund: None,
            escalation: None,
            decisions: Vec::new(),
            recovery_attempts: 0,
            checkpoint_seq: 0,
            rng_seed: 0,
            history: Vec::new(),
        }
    }

    pub fn activation_window(&self) -> Duration {
        Duration::from_secs(self.activation_window_secs)
    }

    pub fn collection_window(&self) -> Duration {
        Duration::from_secs(self.collection_window_secs)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Raise progress; never lowers it.
    pub fn raise_progress(&mut self, value: f64) {
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}

/// One phase's timer for a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub phase: UnitPhase,
    /// Offset from the phase anchor, inside `[0, window)`.
    pub offset_ms: u64,
    pub executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl ScheduledEvent {
    pub fn new(phase: UnitPhase, offset: Duration) -> Self {
        Self {
            phase,
            offset_ms: u64::try_from(offset.as_millis()).unwrap_or(u64::MAX),
            executed: false,
            realized_amount: None,
            correlation_ref: None,
            executed_at: None,
        }
    }

    pub fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms)
    }
}

/// Record of one unit execution (all its attempts) in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub phase: UnitPhase,
    pub success: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_amount: Option<Decimal>,
    pub at: DateTime<Utc>,
}

impl UnitOutcome {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationUnit {
    pub index: usize,
    pub handle: String,
    pub amount: Decimal,
    pub activation: ScheduledEvent,
    pub collection: ScheduledEvent,
    pub activated: bool,
    pub collected: bool,
    pub profit: Decimal,
    /// Set when the collection realized less than the allocation.
    #[serde(default)]
    pub zero_profit: bool,
    #[serde(default)]
    pub outcomes: Vec<UnitOutcome>,
}

impl AllocationUnit {
    pub fn new(
        index: usize,
        handle: impl Into<String>,
        amount: Decimal,
        activation_offset: Duration,
        collection_offset: Duration,
    ) -> Self {
        Self {
            index,
            handle: handle.into(),
            amount,
            activation: ScheduledEvent::new(UnitPhase::Activation, activation_offset),
            collection: ScheduledEvent::new(UnitPhase::Collection, collection_offset),
            activated: false,
            collected: false,
            profit: Decimal::ZERO,
            zero_profit: false,
            outcomes: Vec::new(),
        }
    }

    pub fn event(&self, phase: UnitPhase) -> &ScheduledEvent {
        match phase {
            UnitPhase::Activation => &self.activation,
            UnitPhase::Collection => &self.collection,
        }
    }

    pub fn event_mut(&mut self, phase: UnitPhase) -> &mut ScheduledEvent {
        match phase {
            UnitPhase::Activation => &mut self.activation,
            UnitPhase::Collection => &mut self.collection,
        }
    }

    /// Whether the unit still has work in `phase`.
    pub fn needs_action(&self, phase: UnitPhase) -> bool {
        match phase {
            UnitPhase::Activation => !self.activated,
            UnitPhase::Collection => self.activated && !self.collected,
        }
    }

    /// Amount to move in `phase`: the allocation going out, whatever the
    /// activation realized coming back.
    pub fn amount_for(&self, phase: UnitPhase) -> Decimal {
        match phase {
            UnitPhase::Activation => self.amount,
            UnitPhase::Collection => self.activation.realized_amount.unwrap_or(self.amount),
        }
    }

    pub fn latest_outcome(&self) -> Option<&UnitOutcome> {
        self.outcomes.last()
    }

    pub fn latest_failed(&self) -> bool {
        self.latest_outcome().is_some_and(|o| !o.success)
    }

    pub fn retry_count(&self) -> u32 {
        self.outcomes.iter().map(UnitOutcome::retries).sum()
    }

    pub fn correlation_refs(&self) -> Vec<String> {
        [&self.activation, &self.collection]
            .into_iter()
            .filter_map(|e| e.correlation_ref.clone())
            .collect()
    }

    pub fn status_label(&self) -> &'static str {
        if self.collected {
            "collected"
        } else if self.latest_failed() {
            "failed"
        } else if self.activated {
            "activated"
        } else {
            "pending"
        }
    }

    /// Apply a successful execution. Collection profit is the realized amount
    /// minus the allocation, clamped at zero.
    pub fn record_success(
        &mut self,
        phase: UnitPhase,
        attempts: u32,
        correlation_ref: String,
        realized_amount: Decimal,
    ) {
        let now = Utc::now();
        let event = self.event_mut(phase);
        event.executed = true;
        event.realized_amount = Some(realized_amount);
        event.correlation_ref = Some(correlation_ref.clone());
        event.executed_at = Some(now);

        match phase {
            UnitPhase::Activation => self.activated = true,
            UnitPhase::Collection => {
                self.collected = true;
                let raw = realized_amount - self.amount;
                self.zero_profit = raw <= Decimal::ZERO;
                self.profit = raw.max(Decimal::ZERO);
            }
        }

        self.outcomes.push(UnitOutcome {
            phase,
            success: true,
            attempts,
            error_kind: None,
            message: None,
            correlation_ref: Some(correlation_ref),
            realized_amount: Some(realized_amount),
            at: now,
        });
    }

    pub fn record_failure(
        &mut self,
        phase: UnitPhase,
        attempts: u32,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        self.outcomes.push(UnitOutcome {
            phase,
            success: false,
            attempts,
            error_kind: Some(kind),
            message: Some(message.into()),
            correlation_ref: None,
            realized_amount: None,
            at: Utc::now(),
        });
    }
}

/// The generated units of a session, persisted once at start so a resume can
/// re-derive amounts and offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitBatch {
    pub session_id: SessionId,
    pub rng_seed: u64,
    pub created_at: DateTime<Utc>,
    pub units: Vec<AllocationUnit>,
}

/// Counts surfaced by status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub total: usize,
    pub activated: usize,
    pub collected: usize,
    pub failed: usize,
}

impl UnitCounts {
    pub fn from_units(units: &[AllocationUnit]) -> Self {
        Self {
            total: units.len(),
            activated: units.iter().filter(|u| u.activated).count(),
            collected: units.iter().filter(|u| u.collected).count(),
            failed: units.iter().filter(|u| u.latest_failed()).count(),
        }
    }

    /// `(activated + collected) / (2N) * 100`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.activated + self.collected) as f64 / (2 * self.total) as f64 * 100.0
    }
}

/// Result of `get_session_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub progress: f64,
    pub counts: UnitCounts,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundRecord>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn unit() -> AllocationUnit {
        AllocationUnit::new(
            0,
            "unit-000",
            dec!(0.020),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_collection_profit_clamped_at_zero() {
        let mut u = unit();
        u.record_success(UnitPhase::Activation, 1, "a".into(), dec!(0.020));
        u.record_success(UnitPhase::Collection, 1, "c".into(), dec!(0.018));
        assert!(u.collected);
        assert_eq!(u.profit, Decimal::ZERO);
        assert!(u.zero_profit);
    }

    #[test]
    fn test_collection_profit_positive() {
        let mut u = unit();
        u.record_success(UnitPhase::Activation, 1, "a".into(), dec!(0.020));
        u.record_success(UnitPhase::Collection, 2, "c".into(), dec!(0.023));
        assert_eq!(u.profit, dec!(0.003));
        assert!(!u.zero_profit);
        assert_eq!(u.retry_count(), 1);
        assert_eq!(u.correlation_refs(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_latest_outcome_drives_failed_flag() {
        let mut u = unit();
        u.record_failure(UnitPhase::Activation, 4, ErrorKind::Timeout, "timed out");
        assert!(u.latest_failed());
        assert!(u.needs_action(UnitPhase::Activation));
        assert!(!u.needs_action(UnitPhase::Collection));

        u.record_success(UnitPhase::Activation, 1, "a".into(), dec!(0.020));
        assert!(!u.latest_failed());
        assert!(u.needs_action(UnitPhase::Collection));
    }

    #[test]
    fn test_progress_formula() {
        let counts = UnitCounts {
            total: 100,
            activated: 60,
            collected: 20,
            failed: 0,
        };
        assert!((counts.progress() - 40.0).abs() < f64::EPSILON);
        assert_eq!(UnitCounts::default().progress(), 0.0);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
        assert!(SessionId::generate().as_str().starts_with("ses-"));
    }
}
