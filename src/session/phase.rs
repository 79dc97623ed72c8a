use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Initializing,
    PaymentPending,
    Created,
    Distributing,
    Collecting,
    Consolidating,
    Completed,
    Failed,
    /// Cancelled by an explicit stop request.
    Stopped,
}

impl SessionPhase {
    pub fn allowed_transitions(&self) -> &'static [SessionPhase] {
        use SessionPhase::*;
        match self {
            Initializing => &[PaymentPending, Failed],
            PaymentPending => &[Created, Failed, Stopped],
            Created => &[Distributing, Failed, Stopped],
            Distributing => &[Collecting, Failed, Stopped],
            Collecting => &[Consolidating, Failed, Stopped],
            Consolidating => &[Completed, Failed, Stopped],
            Completed => &[],
            Failed => &[],
            Stopped => &[],
        }
    }

    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Stopped
        )
    }

    /// Phases in which units are being executed or funds are moving.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionPhase::Distributing | SessionPhase::Collecting | SessionPhase::Consolidating
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::PaymentPending => "payment_pending",
            Self::Created => "created",
            Self::Distributing => "distributing",
            Self::Collecting => "collecting",
            Self::Consolidating => "consolidating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "Initializing",
            Self::PaymentPending => "PaymentPending",
            Self::Created => "Created",
            Self::Distributing => "Distributing",
            Self::Collecting => "Collecting",
            Self::Consolidating => "Consolidating",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl PhaseTransition {
    pub fn new(from: SessionPhase, to: SessionPhase, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_linear() {
        use SessionPhase::*;
        let path = [
            Initializing,
            PaymentPending,
            Created,
            Distributing,
            Collecting,
            Consolidating,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        assert!(!SessionPhase::Created.can_transition_to(SessionPhase::Collecting));
        assert!(!SessionPhase::Distributing.can_transition_to(SessionPhase::Consolidating));
        assert!(!SessionPhase::PaymentPending.can_transition_to(SessionPhase::Distributing));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        use SessionPhase::*;
        for phase in [
            Initializing,
            PaymentPending,
            Created,
            Distributing,
            Collecting,
            Consolidating,
        ] {
            assert!(phase.can_transition_to(Failed), "{}", phase);
        }
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for phase in [SessionPhase::Completed, SessionPhase::Failed, SessionPhase::Stopped] {
            assert!(phase.is_terminal());
            assert!(phase.allowed_transitions().is_empty());
            assert!(!phase.can_transition_to(SessionPhase::Stopped));
        }
    }
}
