//! Operator escalation for sessions that need manual intervention.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::decision::RecoveryDecision;
use super::refund::{RefundRecord, RefundStatus};
use crate::error::ErrorKind;
use crate::session::{AllocationUnit, SessionId, SessionPhase, UnitPhase};

/// Context handed to an operator when a session cannot finish on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    pub id: String,
    pub session_id: SessionId,
    pub summary: String,
    pub phase: SessionPhase,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<RecoveryDecision>,
    #[serde(default)]
    pub failed_units: Vec<FailedUnit>,
    #[serde(default)]
    pub errors: BTreeMap<ErrorKind, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundRecord>,
    pub suggested_actions: Vec<OperatorAction>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
}

impl EscalationContext {
    pub fn new(
        session_id: SessionId,
        phase: SessionPhase,
        progress: f64,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("esc-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            session_id,
            summary: summary.into(),
            phase,
            progress,
            decision: None,
            failed_units: Vec::new(),
            errors: BTreeMap::new(),
            refund: None,
            suggested_actions: vec![OperatorAction::Acknowledge],
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_decision(mut self, decision: RecoveryDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Collect every unit whose latest outcome failed, and the error histogram.
    pub fn with_units(mut self, units: &[AllocationUnit]) -> Self {
        for unit in units.iter().filter(|u| u.latest_failed()) {
            if let Some(outcome) = unit.latest_outcome() {
                let kind = outcome.error_kind.unwrap_or(ErrorKind::Unknown);
                *self.errors.entry(kind).or_insert(0) += 1;
                self.failed_units.push(FailedUnit {
                    index: unit.index,
                    handle: unit.handle.clone(),
                    phase: outcome.phase,
                    error_kind: kind,
                    message: outcome.message.clone().unwrap_or_default(),
                    attempts: outcome.attempts,
                });
            }
        }
        if !self.failed_units.is_empty() {
            self.add_action(OperatorAction::ReviewUnits {
                count: self.failed_units.len(),
            });
        }
        if self.errors.contains_key(&ErrorKind::InsufficientFunds) {
            self.add_action(OperatorAction::TopUpOperatingAccount);
        }
        self
    }

    pub fn with_refund(mut self, record: RefundRecord) -> Self {
        match record.status {
            RefundStatus::Failed => self.add_action(OperatorAction::RetryRefund),
            RefundStatus::Pending => self.add_action(OperatorAction::ReconcileRefund),
            RefundStatus::Completed => {}
        }
        self.refund = Some(record);
        self
    }

    /// Insert ahead of the trailing `Acknowledge`, skipping duplicates.
    pub fn add_action(&mut self, action: OperatorAction) {
        if !self
            .suggested_actions
            .iter()
            .any(|a| a.label() == action.label())
        {
            self.suggested_actions
                .insert(self.suggested_actions.len().saturating_sub(1), action);
        }
    }

    pub fn acknowledge(&mut self) {
        self.status = EscalationStatus::Acknowledged;
    }

    pub fn to_message(&self) -> String {
        let actions = self
            .suggested_actions
            .iter()
            .enumerate()
            .map(|(i, a)| format!("║   {}. {}", i + 1, a.display_text()))
            .collect::<Vec<_>>()
            .join("\n");

        let units = if self.failed_units.is_empty() {
            "║   None".to_string()
        } else {
            let mut lines: Vec<String> = self
                .failed_units
                .iter()
                .take(5)
                .map(|u| {
                    format!(
                        "║   - {} ({}): {} after {} attempt(s)",
                        u.handle, u.phase, u.error_kind, u.attempts
                    )
                })
                .collect();
            if self.failed_units.len() > 5 {
                lines.push(format!("║   ... and {} more", self.failed_units.len() - 5));
            }
            lines.join("\n")
        };

        let refund = match &self.refund {
            Some(r) => format!("{} ({})", r.status, r.amount),
            None => "not attempted".to_string(),
        };

        let rule = self
            .decision
            .as_ref()
            .map(|d| format!("{:?}", d.rule))
            .unwrap_or_else(|| "n/a".to_string());

        format!(
            r"
╔══════════════════════════════════════════════════════════════╗
║               MANUAL INTERVENTION REQUIRED                   ║
╠══════════════════════════════════════════════════════════════╣
║ Session: {}
║ Escalation ID: {}
║ Phase: {}  Progress: {:.1}%
║ Rule: {}
║ Refund: {}
╠══════════════════════════════════════════════════════════════╣
║ Summary:
║ {}
╠══════════════════════════════════════════════════════════════╣
║ Failed Units:
{}
╠══════════════════════════════════════════════════════════════╣
║ Suggested Actions:
{}
╚══════════════════════════════════════════════════════════════╝
",
            self.session_id,
            self.id,
            self.phase,
            self.progress,
            rule,
            refund,
            self.summary,
            units,
            actions
        )
    }

    pub fn log(&self) {
        warn!(
            session_id = %self.session_id,
            escalation_id = self.id,
            failed_units = self.failed_units.len(),
            "Escalation created"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub index: usize,
    pub handle: String,
    pub phase: UnitPhase,
    pub error_kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorAction {
    RetryRefund,
    ReconcileRefund,
    TopUpOperatingAccount,
    ReconnectSigner,
    ReviewUnits { count: usize },
    Acknowledge,
}

impl OperatorAction {
    pub fn display_text(&self) -> String {
        match self {
            Self::RetryRefund => "Retry the failed refund (fanout-pilot refund <id>)".to_string(),
            Self::ReconcileRefund => {
                "Check the ledger for the refund transfer before retrying".to_string()
            }
            Self::TopUpOperatingAccount => "Top up the operating account".to_string(),
            Self::ReconnectSigner => "Reconnect the signer".to_string(),
            Self::ReviewUnits { count } => format!("Review {} failed unit(s)", count),
            Self::Acknowledge => "Acknowledge and close".to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RetryRefund => "retry-refund",
            Self::ReconcileRefund => "reconcile-refund",
            Self::TopUpOperatingAccount => "top-up",
            Self::ReconnectSigner => "reconnect-signer",
            Self::ReviewUnits { .. } => "review-units",
            Self::Acknowledge => "acknowledge",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_failed_units_and_actions_collected() {
        let mut ok = AllocationUnit::new(0, "u-0", dec!(0.02), Duration::ZERO, Duration::ZERO);
        ok.record_success(UnitPhase::Activation, 1, "r".into(), dec!(0.02));
        let mut bad = AllocationUnit::new(1, "u-1", dec!(0.02), Duration::ZERO, Duration::ZERO);
        bad.record_failure(
            UnitPhase::Activation,
            1,
            ErrorKind::InsufficientFunds,
            "balance too low",
        );

        let ctx = EscalationContext::new(
            SessionId::from("ses-1"),
            SessionPhase::Distributing,
            25.0,
            "stuck",
        )
        .with_units(&[ok, bad]);

        assert_eq!(ctx.failed_units.len(), 1);
        assert_eq!(ctx.failed_units[0].handle, "u-1");
        assert_eq!(ctx.errors.get(&ErrorKind::InsufficientFunds), Some(&1));
        let labels: Vec<_> = ctx.suggested_actions.iter().map(|a| a.label()).collect();
        assert_eq!(labels, vec!["review-units", "top-up", "acknowledge"]);
    }

    #[test]
    fn test_message_mentions_session_and_refund() {
        let ctx = EscalationContext::new(
            SessionId::from("ses-42"),
            SessionPhase::Collecting,
            62.5,
            "consolidation blocked",
        );
        let msg = ctx.to_message();
        assert!(msg.contains("ses-42"));
        assert!(msg.contains("not attempted"));
        assert!(msg.contains("62.5%"));
    }

    #[test]
    fn test_pending_refund_asks_for_reconciliation() {
        let now = Utc::now();
        let ctx = EscalationContext::new(
            SessionId::from("ses-7"),
            SessionPhase::Failed,
            40.0,
            "refund outcome unknown",
        )
        .with_refund(RefundRecord {
            session_id: SessionId::from("ses-7"),
            payer_account: "payer".into(),
            amount: dec!(3.20),
            status: RefundStatus::Pending,
            reason: "failure rate".into(),
            correlation_ref: None,
            error: None,
            error_kind: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        });

        let labels: Vec<_> = ctx.suggested_actions.iter().map(|a| a.label()).collect();
        assert_eq!(labels, vec!["reconcile-refund", "acknowledge"]);
        assert!(ctx.to_message().contains("pending (3.20)"));
    }
}
