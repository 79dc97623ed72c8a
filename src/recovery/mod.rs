//! Failure recovery for sessions.
//!
//! This module handles:
//! - Per-attempt retry decisions with exponential backoff
//! - Session-level decisions: refund, session recovery or manual intervention
//! - Checkpoint snapshots used to resume a session
//! - Idempotent refunds of the upfront payment
//! - Operator escalation context

mod checkpoint;
mod decision;
mod escalation;
mod refund;
mod retry;

pub use checkpoint::{Checkpoint, UnitCheckpoint};
pub use decision::{
    DecisionRule, FailureContext, RecoveryAction, RecoveryDecision, RecoveryManager,
};
pub use escalation::{EscalationContext, EscalationStatus, FailedUnit, OperatorAction};
pub use refund::{RefundManager, RefundOutcome, RefundRecord, RefundRequest, RefundStatus};
pub use retry::RetryPolicy;
