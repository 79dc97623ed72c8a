use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::{AllocationUnit, Session, SessionId, SessionStatusView, UnitCounts};
use super::phase::{PhaseTransition, SessionPhase};
use crate::error::{PilotError, Result};
use crate::metrics::SessionMetrics;

/// Progress ceiling until the session reaches `Completed`.
pub const PROGRESS_CEILING: f64 = 99.0;

/// Mutable state of one session. Only ever touched under its handle's lock.
#[derive(Debug)]
pub struct SessionState {
    pub session: Session,
    pub units: Vec<AllocationUnit>,
    pub metrics: SessionMetrics,
}

impl SessionState {
    pub fn new(session: Session, units: Vec<AllocationUnit>, refs_capacity: usize) -> Self {
        let metrics = SessionMetrics::from_units(&units, refs_capacity);
        Self {
            session,
            units,
            metrics,
        }
    }

    /// Move to `to`, recording the transition. Entering a unit phase
    /// re-anchors offsets; entering a terminal phase stamps `finished_at`.
    pub fn transition(&mut self, to: SessionPhase, reason: impl Into<String>) -> Result<()> {
        let from = self.session.phase;
        if !from.can_transition_to(to) {
            return Err(PilotError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
                allowed: from
                    .allowed_transitions()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        let reason = reason.into();
        debug!(session_id = %self.session.id, %from, %to, reason, "Phase transition");

        let transition = PhaseTransition::new(from, to, reason);
        let at = transition.at;
        self.session.history.push(transition);
        self.session.phase = to;
        self.session.updated_at = at;

        match to {
            SessionPhase::Distributing | SessionPhase::Collecting => {
                self.session.phase_started_at = Some(at);
                if self.session.started_at.is_none() {
                    self.session.started_at = Some(at);
                }
            }
            SessionPhase::Completed => {
                self.session.progress = 100.0;
                self.session.finished_at = Some(at);
            }
            SessionPhase::Failed | SessionPhase::Stopped => {
                self.session.finished_at = Some(at);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn counts(&self) -> UnitCounts {
        UnitCounts {
            total: self.session.unit_count,
            ..UnitCounts::from_units(&self.units)
        }
    }

    /// Raise progress from unit counts, held below 100 until completion.
    pub fn refresh_progress(&mut self) {
        let progress = self.counts().progress().min(PROGRESS_CEILING);
        self.session.raise_progress(progress);
    }

    pub fn status_view(&self) -> SessionStatusView {
        SessionStatusView {
            session_id: self.session.id.clone(),
            phase: self.session.phase,
            progress: self.session.progress,
            counts: self.counts(),
            status: self.session.status.clone(),
            refund: self.session.refund.clone(),
            updated_at: self.session.updated_at,
        }
    }
}

/// Live handle of a registered session: its state, cancel signal and
/// phase broadcast.
pub struct SessionHandle {
    id: SessionId,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    phase_tx: watch::Sender<SessionPhase>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(state: SessionState) -> Self {
        let (phase_tx, _) = watch::channel(state.session.phase);
        Self {
            id: state.session.id.clone(),
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            phase_tx,
            driver: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().session.phase
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn publish_phase(&self, phase: SessionPhase) {
        self.phase_tx.send_replace(phase);
    }

    pub fn set_driver(&self, handle: JoinHandle<()>) {
        *self.driver.lock() = Some(handle);
    }

    pub fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().take()
    }
}

/// In-process index of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, replacing a terminal entry under the same id.
    pub fn insert(&self, handle: Arc<SessionHandle>) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(handle.id().clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().phase().is_terminal() {
                    return Err(PilotError::SessionAlreadyRunning(handle.id().to_string()));
                }
                existing.insert(handle);
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|h| Arc::clone(h.value()))
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(id).map(|(_, h)| h)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::session::SessionRequest;

    fn state(id: &str) -> SessionState {
        let request = SessionRequest::from_defaults(&Default::default(), "payer")
            .with_total(dec!(0.04))
            .with_unit_count(2)
            .with_bounds(dec!(0.01), dec!(0.03));
        SessionState::new(Session::new(SessionId::from(id), &request), Vec::new(), 8)
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let mut st = state("ses-a");
        let err = st.transition(SessionPhase::Collecting, "skip").unwrap_err();
        assert!(matches!(err, PilotError::InvalidStateTransition { .. }));
        assert_eq!(st.session.phase, SessionPhase::Initializing);
        assert!(st.session.history.is_empty());
    }

    #[test]
    fn test_transition_stamps_anchors() {
        let mut st = state("ses-b");
        st.transition(SessionPhase::PaymentPending, "created").unwrap();
        st.transition(SessionPhase::Created, "paid").unwrap();
        st.transition(SessionPhase::Distributing, "start").unwrap();
        assert!(st.session.phase_started_at.is_some());
        assert!(st.session.started_at.is_some());
        assert!(st.session.finished_at.is_none());

        st.transition(SessionPhase::Stopped, "stop").unwrap();
        assert!(st.session.finished_at.is_some());
        assert_eq!(st.session.history.len(), 4);
    }

    #[test]
    fn test_registry_rejects_duplicate_live_session() {
        let registry = SessionRegistry::new();
        let mut live = state("ses-c");
        live.transition(SessionPhase::PaymentPending, "created").unwrap();
        registry.insert(Arc::new(SessionHandle::new(live))).unwrap();

        let again = state("ses-c");
        assert!(matches!(
            registry.insert(Arc::new(SessionHandle::new(again))),
            Err(PilotError::SessionAlreadyRunning(_))
        ));
        assert_eq!(registry.ids(), vec![SessionId::from("ses-c")]);
    }
}
