use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::retry::RetryPolicy;
use crate::config::RecoveryConfig;
use crate::error::{ErrorKind, ExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry { delay_ms: u64 },
    Refund,
    SessionRecovery,
    ManualIntervention,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Refund => "refund",
            Self::SessionRecovery => "session_recovery",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { delay_ms } => write!(f, "retry in {}ms", delay_ms),
            other => f.write_str(other.label()),
        }
    }
}

/// Which rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    TransientError,
    CriticalError,
    InsufficientFunds,
    FailureRate,
    EarlyFailure,
    StopSnapshot,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    pub rule: DecisionRule,
    pub reason: String,
    pub progress: f64,
    pub failure_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub decided_at: DateTime<Utc>,
}

impl RecoveryDecision {
    fn new(
        action: RecoveryAction,
        rule: DecisionRule,
        reason: impl Into<String>,
        ctx: &FailureContext,
    ) -> Self {
        Self {
            action,
            rule,
            reason: reason.into(),
            progress: ctx.progress,
            failure_rate: ctx.failure_rate,
            error_kind: ctx.critical.or_else(|| ctx.dominant_error()),
            decided_at: Utc::now(),
        }
    }
}

/// Snapshot of a session at the moment a decision is needed.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// Critical error that aborted the phase, if any.
    pub critical: Option<ErrorKind>,
    /// The session was stopped on request; `progress` is the stop snapshot.
    pub stopped: bool,
    pub progress: f64,
    /// Units whose latest outcome failed, over units with any outcome.
    pub failure_rate: f64,
    /// Failed units by classified error.
    pub errors: BTreeMap<ErrorKind, usize>,
    pub recovery_attempts: u32,
    pub has_checkpoint: bool,
}

impl FailureContext {
    pub fn dominant_error(&self) -> Option<ErrorKind> {
        self.errors
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| *kind)
    }
}

/// Applies the ordered recovery rules.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    config: RecoveryConfig,
    retry: RetryPolicy,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Per-attempt verdict for a unit: `Some(Retry)` while the error is
    /// transient and the budget allows, `None` once the unit has failed.
    pub fn decide_attempt(&self, error: &ExecutionError, attempt: u32) -> Option<RecoveryDecision> {
        let delay = self.retry.next_delay(error, attempt)?;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Some(RecoveryDecision {
            action: RecoveryAction::Retry { delay_ms },
            rule: DecisionRule::TransientError,
            reason: format!("{} on attempt {}", error.kind(), attempt),
            progress: 0.0,
            failure_rate: 0.0,
            error_kind: Some(error.kind()),
            decided_at: Utc::now(),
        })
    }

    /// Session-level decision after a phase ended with failures, a critical
    /// error, or a stop request.
    pub fn decide(&self, ctx: &FailureContext) -> RecoveryDecision {
        let decision = self.apply_rules(ctx);
        info!(
            action = decision.action.label(),
            rule = ?decision.rule,
            progress = ctx.progress,
            failure_rate = ctx.failure_rate,
            "Recovery decision"
        );
        decision
    }

    fn apply_rules(&self, ctx: &FailureContext) -> RecoveryDecision {
        let early = ctx.progress < self.config.early_failure_progress_threshold;
        let can_recover =
            ctx.has_checkpoint && ctx.recovery_attempts < self.config.max_recovery_attempts;

        if ctx.stopped {
            return if early {
                RecoveryDecision::new(
                    RecoveryAction::Refund,
                    DecisionRule::StopSnapshot,
                    format!(
                        "Stopped at {:.1}% progress, below the {:.1}% early threshold",
                        ctx.progress, self.config.early_failure_progress_threshold
                    ),
                    ctx,
                )
            } else {
                RecoveryDecision::new(
                    RecoveryAction::ManualIntervention,
                    DecisionRule::StopSnapshot,
                    format!(
                        "Stopped at {:.1}% progress; value already distributed",
                        ctx.progress
                    ),
                    ctx,
                )
            };
        }

        if let Some(kind) = ctx.critical {
            if can_recover {
                return RecoveryDecision::new(
                    RecoveryAction::SessionRecovery,
                    DecisionRule::CriticalError,
                    format!(
                        "{} aborted the phase; resuming from checkpoint (attempt {}/{})",
                        kind,
                        ctx.recovery_attempts + 1,
                        self.config.max_recovery_attempts
                    ),
                    ctx,
                );
            }
            let why = if ctx.has_checkpoint {
                "recovery attempts exhausted"
            } else {
                "no checkpoint to resume from"
            };
            return RecoveryDecision::new(
                RecoveryAction::Refund,
                DecisionRule::CriticalError,
                format!("{} aborted the phase and {}", kind, why),
                ctx,
            );
        }

        if let Some(count) = ctx.errors.get(&ErrorKind::InsufficientFunds)
            && *count > 0
        {
            return RecoveryDecision::new(
                RecoveryAction::ManualIntervention,
                DecisionRule::InsufficientFunds,
                format!(
                    "{} unit(s) failed on insufficient funds; operating account needs a top-up",
                    count
                ),
                ctx,
            );
        }

        if ctx.failure_rate > self.config.failure_rate_refund_threshold {
            return RecoveryDecision::new(
                RecoveryAction::Refund,
                DecisionRule::FailureRate,
                format!(
                    "Failure rate {:.1}% exceeds {:.1}% threshold",
                    ctx.failure_rate * 100.0,
                    self.config.failure_rate_refund_threshold * 100.0
                ),
                ctx,
            );
        }

        if early {
            if can_recover {
                return RecoveryDecision::new(
                    RecoveryAction::SessionRecovery,
                    DecisionRule::EarlyFailure,
                    format!(
                        "Failure at {:.1}% progress; retrying pending units from checkpoint",
                        ctx.progress
                    ),
                    ctx,
                );
            }
            debug!(
                recovery_attempts = ctx.recovery_attempts,
                has_checkpoint = ctx.has_checkpoint,
                "Early failure but session recovery unavailable"
            );
        }

        RecoveryDecision::new(
            RecoveryAction::ManualIntervention,
            DecisionRule::Fallback,
            format!(
                "Unrecoverable failure at {:.1}% progress; partial value may be distributed",
                ctx.progress
            ),
            ctx,
        )
    }
}
