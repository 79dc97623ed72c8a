use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    PaymentConfirmed,
    SessionStarted,
    PhaseChanged,
    UnitFailed,
    RecoveryStarted,
    RefundIssued,
    RefundFailed,
    Escalated,
    SessionCompleted,
    SessionFailed,
    SessionStopped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::PaymentConfirmed => "session.payment_confirmed",
            Self::SessionStarted => "session.started",
            Self::PhaseChanged => "session.phase_changed",
            Self::UnitFailed => "unit.failed",
            Self::RecoveryStarted => "recovery.started",
            Self::RefundIssued => "refund.issued",
            Self::RefundFailed => "refund.failed",
            Self::Escalated => "session.escalated",
            Self::SessionCompleted => "session.completed",
            Self::SessionFailed => "session.failed",
            Self::SessionStopped => "session.stopped",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::UnitFailed | Self::RefundFailed | Self::Escalated | Self::SessionFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub event_type: EventType,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<SessionPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl SessionEvent {
    pub fn new(event_type: EventType, session_id: &SessionId) -> Self {
        Self {
            event_type,
            session_id: session_id.clone(),
            created_at: Utc::now(),
            phase: None,
            unit: None,
            message: None,
            progress: None,
        }
    }

    pub fn with_phase(mut self, phase: SessionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }
}
