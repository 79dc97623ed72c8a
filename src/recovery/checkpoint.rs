use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PilotError, Result};
use crate::session::{
    AllocationUnit, Session, SessionId, SessionPhase, UnitBatch, UnitCounts, UnitOutcome,
};

/// Point-in-time snapshot written after every phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// Session record at the time of the snapshot.
    pub session: Session,
    pub unit_states: Vec<UnitCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitCheckpoint {
    pub index: usize,
    pub activated: bool,
    pub collected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_realized: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_realized: Option<Decimal>,
    #[serde(default)]
    pub outcomes: Vec<UnitOutcome>,
}

impl UnitCheckpoint {
    pub fn failed(&self) -> bool {
        self.outcomes.last().is_some_and(|o| !o.success)
    }

    fn from_unit(unit: &AllocationUnit) -> Self {
        Self {
            index: unit.index,
            activated: unit.activated,
            collected: unit.collected,
            activation_ref: unit.activation.correlation_ref.clone(),
            collection_ref: unit.collection.correlation_ref.clone(),
            activation_realized: unit.activation.realized_amount,
            collection_realized: unit.collection.realized_amount,
            outcomes: unit.outcomes.clone(),
        }
    }
}

impl Checkpoint {
    /// Capture `session` and `units`. Ids sort chronologically: a millisecond
    /// timestamp followed by the session's checkpoint sequence number.
    pub fn capture(
        session: &Session,
        units: &[AllocationUnit],
        seq: u32,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let id = format!(
            "{}-{:04}-{}",
            now.format("%Y%m%dT%H%M%S%3fZ"),
            seq,
            session.phase.as_str()
        );
        Self {
            id,
            session_id: session.id.clone(),
            phase: session.phase,
            progress: session.progress,
            created_at: now,
            reason: reason.into(),
            session: session.clone(),
            unit_states: units.iter().map(UnitCheckpoint::from_unit).collect(),
        }
    }

    /// New checkpoint carrying an updated session record over the same unit
    /// states, for changes made after the session went terminal.
    pub fn amend(&self, mut session: Session, reason: impl Into<String>) -> Self {
        session.checkpoint_seq += 1;
        let mut next = Self::capture(&session, &[], session.checkpoint_seq, reason);
        next.unit_states = self.unit_states.clone();
        next
    }

    pub fn unit_counts(&self) -> UnitCounts {
        UnitCounts {
            total: self.session.unit_count,
            activated: self.unit_states.iter().filter(|u| u.activated).count(),
            collected: self.unit_states.iter().filter(|u| u.collected).count(),
            failed: self.unit_states.iter().filter(|u| u.failed()).count(),
        }
    }

    /// Rebuild live units from the batch, overlaying this checkpoint's flags
    /// and references. Fails if the batch does not belong to the same session
    /// or has a different unit count.
    pub fn restore_units(&self, batch: &UnitBatch) -> Result<Vec<AllocationUnit>> {
        if batch.session_id != self.session_id {
            return Err(PilotError::Recovery(format!(
                "unit batch belongs to {}, checkpoint to {}",
                batch.session_id, self.session_id
            )));
        }
        if batch.units.len() != self.unit_states.len() {
            return Err(PilotError::Recovery(format!(
                "unit batch has {} units, checkpoint has {}",
                batch.units.len(),
                self.unit_states.len()
            )));
        }

        let mut units = batch.units.clone();
        for state in &self.unit_states {
            let unit = units.get_mut(state.index).ok_or_else(|| {
                PilotError::Recovery(format!("checkpoint references unknown unit {}", state.index))
            })?;

            unit.activated = state.activated;
            unit.activation.executed = state.activated;
            unit.activation.correlation_ref = state.activation_ref.clone();
            unit.activation.realized_amount = state.activation_realized;

            unit.collected = state.collected;
            unit.collection.executed = state.collected;
            unit.collection.correlation_ref = state.collection_ref.clone();
            unit.collection.realized_amount = state.collection_realized;
            unit.outcomes = state.outcomes.clone();

            if let Some(realized) = state.collection_realized {
                let raw = realized - unit.amount;
                unit.zero_profit = raw <= Decimal::ZERO;
                unit.profit = raw.max(Decimal::ZERO);
            }
        }
        Ok(units)
    }
}
