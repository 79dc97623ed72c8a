//! Session lifecycle.
//!
//! - `SessionController`: public operations (create, pay, start, stop,
//!   resume, status, reports)
//! - `SessionRegistry`: live sessions and their per-session lock
//! - phase runner: background driver that executes units phase by phase

mod controller;
mod model;
mod phase;
mod registry;
mod runner;

pub use controller::{Backends, SessionController};
pub use model::{
    AllocationUnit, Consolidation, PaymentReceipt, ScheduledEvent, Session, SessionId,
    SessionRequest, SessionStatus, SessionStatusView, UnitBatch, UnitCounts, UnitOutcome,
    UnitPhase,
};
pub use phase::{PhaseTransition, SessionPhase};
pub use registry::{PROGRESS_CEILING, SessionHandle, SessionRegistry, SessionState};
