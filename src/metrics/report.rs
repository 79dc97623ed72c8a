use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};
use crate::recovery::{RefundRecord, RefundStatus};
use crate::session::{AllocationUnit, Session, SessionId, SessionPhase};

/// Immutable summary of a session, built from session and unit state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub generated_at: DateTime<Utc>,
    pub summary: ExecutionSummary,
    pub units: Vec<UnitReport>,
    pub errors: ErrorAnalysis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<ConsolidationReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub session_id: SessionId,
    pub final_phase: SessionPhase,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    pub total: Decimal,
    pub unit_count: usize,
    pub activated: usize,
    pub collected: usize,
    pub failed: usize,
    pub progress: f64,
    /// Collected units over all units.
    pub success_rate: f64,
    pub total_profit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target: Option<Decimal>,
    pub target_reached: bool,
    pub recovery_attempts: u32,
    pub refund: RefundSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundSummary {
    pub attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RefundStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefundSummary {
    pub fn from_record(record: Option<&RefundRecord>) -> Self {
        match record {
            Some(r) => Self {
                attempted: true,
                status: Some(r.status),
                amount: Some(r.amount),
                correlation_ref: r.correlation_ref.clone(),
                error: r.error.clone(),
            },
            None => Self {
                attempted: false,
                status: None,
                amount: None,
                correlation_ref: None,
                error: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub index: usize,
    pub handle: String,
    pub amount: Decimal,
    pub status: String,
    pub profit: Decimal,
    pub zero_profit: bool,
    pub retry_count: u32,
    pub correlation_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    /// Failed unit executions by classified kind.
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub total_failures: usize,
    /// Units whose latest outcome is a failure.
    pub failed_units: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub correlation_ref: String,
    pub destination: String,
    pub amount: Decimal,
    pub at: DateTime<Utc>,
}

impl SessionReport {
    /// Pure read over `session` and `units`; only `generated_at` varies
    /// between calls on the same state.
    pub fn build(session: &Session, units: &[AllocationUnit]) -> Self {
        let mut ordered: Vec<&AllocationUnit> = units.iter().collect();
        ordered.sort_by_key(|u| u.index);

        let activated = ordered.iter().filter(|u| u.activated).count();
        let collected = ordered.iter().filter(|u| u.collected).count();
        let failed = ordered.iter().filter(|u| u.latest_failed()).count();
        let total_profit: Decimal = ordered.iter().map(|u| u.profit).sum();

        let success_rate = if session.unit_count > 0 {
            collected as f64 / session.unit_count as f64
        } else {
            0.0
        };

        let target_reached = match session.profit_target {
            Some(target) => total_profit >= target,
            None => session.unit_count > 0 && collected == session.unit_count,
        };

        let mut by_kind = BTreeMap::new();
        let mut total_failures = 0;
        for unit in &ordered {
            for outcome in unit.outcomes.iter().filter(|o| !o.success) {
                *by_kind
                    .entry(outcome.error_kind.unwrap_or(ErrorKind::Unknown))
                    .or_insert(0) += 1;
                total_failures += 1;
            }
        }

        let unit_reports = ordered
            .iter()
            .map(|u| UnitReport {
                index: u.index,
                handle: u.handle.clone(),
                amount: u.amount,
                status: u.status_label().to_string(),
                profit: u.profit,
                zero_profit: u.zero_profit,
                retry_count: u.retry_count(),
                correlation_refs: u.correlation_refs(),
                last_error: u
                    .latest_outcome()
                    .filter(|o| !o.success)
                    .and_then(|o| o.error_kind),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            summary: ExecutionSummary {
                session_id: session.id.clone(),
                final_phase: session.phase,
                status: session.status.message.clone(),
                error_kind: session.status.error_kind,
                started_at: session.started_at,
                finished_at: session.finished_at,
                duration_secs: session
                    .finished_at
                    .and(session.duration())
                    .map(|d| d.num_seconds()),
                total: session.total,
                unit_count: session.unit_count,
                activated,
                collected,
                failed,
                progress: session.progress,
                success_rate,
                total_profit,
                profit_target: session.profit_target,
                target_reached,
                recovery_attempts: session.recovery_attempts,
                refund: RefundSummary::from_record(session.refund.as_ref()),
            },
            units: unit_reports,
            errors: ErrorAnalysis {
                by_kind,
                total_failures,
                failed_units: failed,
            },
            consolidation: session.consolidation.as_ref().map(|c| ConsolidationReport {
                correlation_ref: c.correlation_ref.clone(),
                destination: c.destination.clone(),
                amount: c.amount,
                at: c.at,
            }),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::session::{SessionRequest, UnitPhase};

    fn completed_session() -> (Session, Vec<AllocationUnit>) {
        let request = SessionRequest::from_defaults(&Default::default(), "payer")
            .with_total(dec!(0.05))
            .with_unit_count(2)
            .with_bounds(dec!(0.02), dec!(0.03))
            .with_profit_target(dec!(0.004));
        let mut session = Session::new(SessionId::from("ses-report"), &request);
        session.phase = SessionPhase::Completed;
        session.started_at = Some(Utc::now());
        session.finished_at = session.started_at.map(|t| t + chrono::Duration::seconds(90));

        let mut a = AllocationUnit::new(1, "unit-1", dec!(0.03), Duration::ZERO, Duration::ZERO);
        a.record_failure(UnitPhase::Activation, 4, ErrorKind::Timeout, "timed out");
        a.record_success(UnitPhase::Activation, 1, "a1".into(), dec!(0.03));
        a.record_success(UnitPhase::Collection, 1, "c1".into(), dec!(0.033));
        let mut b = AllocationUnit::new(0, "unit-0", dec!(0.02), Duration::ZERO, Duration::ZERO);
        b.record_success(UnitPhase::Activation, 3, "a0".into(), dec!(0.02));
        b.record_success(UnitPhase::Collection, 1, "c0".into(), dec!(0.021));

        (session, vec![a, b])
    }

    #[test]
    fn test_report_summary_and_breakdown() {
        let (session, units) = completed_session();
        let report = SessionReport::build(&session, &units);

        assert_eq!(report.units[0].handle, "unit-0");
        assert_eq!(report.units[0].retry_count, 2);
        assert_eq!(report.units[1].retry_count, 3);
        assert_eq!(report.summary.total_profit, dec!(0.004));
        assert!(report.summary.target_reached);
        assert!((report.summary.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.summary.duration_secs, Some(90));
        assert_eq!(report.errors.by_kind.get(&ErrorKind::Timeout), Some(&1));
        assert_eq!(report.errors.failed_units, 0);
        assert!(!report.summary.refund.attempted);
    }

    #[test]
    fn test_report_is_deterministic_apart_from_timestamp() {
        let (session, units) = completed_session();
        let mut first = SessionReport::build(&session, &units);
        let mut second = SessionReport::build(&session, &units);
        let fixed = Utc::now();
        first.generated_at = fixed;
        second.generated_at = fixed;
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }
}
