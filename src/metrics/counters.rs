use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-wide counters shared by every session.
#[derive(Debug, Default)]
pub struct PilotMetrics {
    sessions_created: AtomicU64,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_stopped: AtomicU64,
    session_recoveries: AtomicU64,
    units_executed: AtomicU64,
    unit_failures: AtomicU64,
    refunds_issued: AtomicU64,
    refunds_failed: AtomicU64,
    escalations: AtomicU64,
}

impl PilotMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_recovery(&self) {
        self.session_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unit_executed(&self, success: bool) {
        self.units_executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.unit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn refund(&self, success: bool) {
        if success {
            self.refunds_issued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refunds_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PilotMetricsSnapshot {
        let units_executed = self.units_executed.load(Ordering::Relaxed);
        let unit_failures = self.unit_failures.load(Ordering::Relaxed);
        let unit_success_rate = if units_executed > 0 {
            (units_executed - unit_failures) as f64 / units_executed as f64
        } else {
            0.0
        };

        PilotMetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            session_recoveries: self.session_recoveries.load(Ordering::Relaxed),
            units_executed,
            unit_failures,
            unit_success_rate,
            refunds_issued: self.refunds_issued.load(Ordering::Relaxed),
            refunds_failed: self.refunds_failed.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PilotMetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_stopped: u64,
    pub session_recoveries: u64,
    pub units_executed: u64,
    pub unit_failures: u64,
    pub unit_success_rate: f64,
    pub refunds_issued: u64,
    pub refunds_failed: u64,
    pub escalations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates() {
        let m = PilotMetrics::new();
        m.unit_executed(true);
        m.unit_executed(true);
        m.unit_executed(true);
        m.unit_executed(false);
        m.refund(true);
        let s = m.snapshot();
        assert_eq!(s.units_executed, 4);
        assert_eq!(s.unit_failures, 1);
        assert!((s.unit_success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(s.refunds_issued, 1);
    }
}
