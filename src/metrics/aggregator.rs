use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::session::{AllocationUnit, UnitCounts, UnitPhase};

/// Live counters for one session, updated on every unit outcome.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    total_units: usize,
    activated: usize,
    collected: usize,
    executed: BTreeSet<usize>,
    failing: BTreeSet<usize>,
    total_profit: Decimal,
    errors: BTreeMap<ErrorKind, usize>,
    recent_refs: VecDeque<String>,
    refs_capacity: usize,
}

impl SessionMetrics {
    pub fn new(total_units: usize, refs_capacity: usize) -> Self {
        Self {
            total_units,
            activated: 0,
            collected: 0,
            executed: BTreeSet::new(),
            failing: BTreeSet::new(),
            total_profit: Decimal::ZERO,
            errors: BTreeMap::new(),
            recent_refs: VecDeque::with_capacity(refs_capacity),
            refs_capacity: refs_capacity.max(1),
        }
    }

    /// Rebuild counters from unit state, e.g. after a resume.
    pub fn from_units(units: &[AllocationUnit], refs_capacity: usize) -> Self {
        let mut metrics = Self::new(units.len(), refs_capacity);
        for unit in units {
            if unit.activated {
                metrics.activated += 1;
            }
            if unit.collected {
                metrics.collected += 1;
                metrics.total_profit += unit.profit;
            }
            if !unit.outcomes.is_empty() || unit.activated {
                metrics.executed.insert(unit.index);
            }
            if unit.latest_failed() {
                metrics.failing.insert(unit.index);
            }
            for outcome in unit.outcomes.iter().filter(|o| !o.success) {
                let kind = outcome.error_kind.unwrap_or(ErrorKind::Unknown);
                *metrics.errors.entry(kind).or_insert(0) += 1;
            }
            for r in unit.correlation_refs() {
                metrics.push_ref(r);
            }
        }
        metrics
    }

    pub fn record_success(
        &mut self,
        unit: usize,
        phase: UnitPhase,
        correlation_ref: &str,
        profit: Decimal,
    ) {
        self.executed.insert(unit);
        self.failing.remove(&unit);
        match phase {
            UnitPhase::Activation => self.activated += 1,
            UnitPhase::Collection => {
                self.collected += 1;
                self.total_profit += profit;
            }
        }
        self.push_ref(correlation_ref.to_string());
    }

    pub fn record_failure(&mut self, unit: usize, kind: ErrorKind) {
        self.executed.insert(unit);
        self.failing.insert(unit);
        *self.errors.entry(kind).or_insert(0) += 1;
    }

    fn push_ref(&mut self, correlation_ref: String) {
        if self.recent_refs.len() == self.refs_capacity {
            self.recent_refs.pop_front();
        }
        self.recent_refs.push_back(correlation_ref);
    }

    pub fn counts(&self) -> UnitCounts {
        UnitCounts {
            total: self.total_units,
            activated: self.activated,
            collected: self.collected,
            failed: self.failing.len(),
        }
    }

    /// Units whose latest outcome failed, over units with any outcome.
    pub fn failure_rate(&self) -> f64 {
        if self.executed.is_empty() {
            return 0.0;
        }
        self.failing.len() as f64 / self.executed.len() as f64
    }

    /// Currently failing units by the error kind of their latest failure.
    pub fn failing_by_kind(&self, units: &[AllocationUnit]) -> BTreeMap<ErrorKind, usize> {
        let mut by_kind = BTreeMap::new();
        for idx in &self.failing {
            let kind = units
                .get(*idx)
                .and_then(|u| u.latest_outcome())
                .and_then(|o| o.error_kind)
                .unwrap_or(ErrorKind::Unknown);
            *by_kind.entry(kind).or_insert(0) += 1;
        }
        by_kind
    }

    pub fn snapshot(&self) -> MetricsView {
        MetricsView {
            counts: self.counts(),
            failure_rate: self.failure_rate(),
            total_profit: self.total_profit,
            errors: self.errors.clone(),
            recent_refs: self.recent_refs.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsView {
    pub counts: UnitCounts,
    pub failure_rate: f64,
    pub total_profit: Decimal,
    /// Failed unit executions by kind, including ones later retried successfully.
    pub errors: BTreeMap<ErrorKind, usize>,
    pub recent_refs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_failure_rate_tracks_latest_outcome() {
        let mut m = SessionMetrics::new(4, 10);
        m.record_failure(0, ErrorKind::Timeout);
        m.record_failure(1, ErrorKind::Timeout);
        m.record_success(2, UnitPhase::Activation, "r2", Decimal::ZERO);
        assert!((m.failure_rate() - 2.0 / 3.0).abs() < 1e-9);

        m.record_success(0, UnitPhase::Activation, "r0", Decimal::ZERO);
        assert!((m.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.counts().failed, 1);
        assert_eq!(m.snapshot().errors.get(&ErrorKind::Timeout), Some(&2));
    }

    #[test]
    fn test_recent_refs_bounded() {
        let mut m = SessionMetrics::new(5, 2);
        for i in 0..5 {
            m.record_success(i, UnitPhase::Activation, &format!("r{}", i), Decimal::ZERO);
        }
        assert_eq!(m.snapshot().recent_refs, vec!["r3".to_string(), "r4".to_string()]);
    }

    #[test]
    fn test_profit_only_from_collections() {
        let mut m = SessionMetrics::new(1, 4);
        m.record_success(0, UnitPhase::Activation, "a", dec!(9));
        m.record_success(0, UnitPhase::Collection, "c", dec!(0.004));
        assert_eq!(m.snapshot().total_profit, dec!(0.004));
        assert_eq!(m.counts().collected, 1);
    }
}
