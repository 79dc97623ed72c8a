use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure classification shared by executors, the recovery
/// manager and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    PaymentFailed,
    SignerDisconnected,
    InsufficientFunds,
    RouteUnavailable,
    ExecutionFailed,
    Timeout,
    CriticalSystemError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::PaymentFailed => "payment_failed",
            Self::SignerDisconnected => "signer_disconnected",
            Self::InsufficientFunds => "insufficient_funds",
            Self::RouteUnavailable => "route_unavailable",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::CriticalSystemError => "critical_system_error",
            Self::Unknown => "unknown",
        }
    }

    /// Critical kinds abort the running phase and go straight to session recovery.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::SignerDisconnected | Self::CriticalSystemError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an external collaborator (router, signer, ledger).
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    SignerDisconnected,
    SignerRejected(String),
    InsufficientFunds { required: String, available: String },
    RouteUnavailable(String),
    /// Execution rejected by the external system. `transient` marks stale-state
    /// rejections that are worth another attempt.
    ExecutionFailed { message: String, transient: bool },
    Timeout { operation: String, duration_ms: u64 },
    Critical(String),
    Other(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SignerDisconnected => ErrorKind::SignerDisconnected,
            Self::SignerRejected(_) => ErrorKind::ExecutionFailed,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::RouteUnavailable(_) => ErrorKind::RouteUnavailable,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Critical(_) => ErrorKind::CriticalSystemError,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RouteUnavailable(_) => true,
            Self::ExecutionFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = Self::has_transient_signature(&message);
        Self::ExecutionFailed { message, transient }
    }

    /// Classify a free-form failure message from an external system.
    /// Only unambiguous markers are matched; everything else stays `Other`.
    pub fn from_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();

        if lower.contains("signer disconnected") || lower.contains("wallet disconnected") {
            return Self::SignerDisconnected;
        }
        if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
            return Self::InsufficientFunds {
                required: "unknown".to_string(),
                available: "unknown".to_string(),
            };
        }
        if lower.contains("no route") || lower.contains("route unavailable") {
            return Self::RouteUnavailable(msg.to_string());
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return Self::Timeout {
                operation: "external call".to_string(),
                duration_ms: 0,
            };
        }
        if Self::has_transient_signature(&lower) {
            return Self::ExecutionFailed {
                message: msg.to_string(),
                transient: true,
            };
        }
        if lower.contains("rejected") || lower.contains("failed") {
            return Self::ExecutionFailed {
                message: msg.to_string(),
                transient: false,
            };
        }

        Self::Other(msg.to_string())
    }

    fn has_transient_signature(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        ["stale", "expired", "blockhash", "nonce", "slippage", "try again"]
            .iter()
            .any(|marker| lower.contains(marker))
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignerDisconnected => write!(f, "Signer disconnected"),
            Self::SignerRejected(msg) => write!(f, "Signer rejected payload: {}", msg),
            Self::InsufficientFunds {
                required,
                available,
            } => write!(
                f,
                "Insufficient funds: required {}, available {}",
                required, available
            ),
            Self::RouteUnavailable(msg) => write!(f, "Route unavailable: {}", msg),
            Self::ExecutionFailed { message, transient } => {
                if *transient {
                    write!(f, "Execution failed (transient): {}", message)
                } else {
                    write!(f, "Execution failed: {}", message)
                }
            }
            Self::Timeout {
                operation,
                duration_ms,
            } => write!(f, "Timeout after {}ms: {}", duration_ms, operation),
            Self::Critical(msg) => write!(f, "Critical system error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Invalid allocation config: {0}")]
    InvalidAllocationConfig(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already running: {0}")]
    SessionAlreadyRunning(String),

    #[error("Invalid state transition: {from} -> {to} (allowed: {allowed})")]
    InvalidStateTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Payment failed for session {session_id}: {reason}")]
    PaymentFailed { session_id: String, reason: String },

    #[error("Refund failed for session {session_id}: {reason}")]
    RefundFailed { session_id: String, reason: String },

    #[error("No checkpoint found for session: {0}")]
    CheckpointNotFound(String),

    #[error("Unit batch not found for session: {0}")]
    BatchNotFound(String),

    #[error("Report not found for session: {0}")]
    ReportNotFound(String),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PilotError {
    /// Error kind surfaced to users alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAllocationConfig(_) | Self::Config(_) => ErrorKind::InvalidConfig,
            Self::PaymentFailed { .. } => ErrorKind::PaymentFailed,
            Self::Execution(e) => e.kind(),
            Self::Persistence(_) | Self::Io(_) => ErrorKind::CriticalSystemError,
            _ => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExecutionError::RouteUnavailable("pool".into()).is_transient());
        assert!(
            ExecutionError::Timeout {
                operation: "quote".into(),
                duration_ms: 100
            }
            .is_transient()
        );
        assert!(ExecutionError::execution_failed("stale reference").is_transient());
        assert!(!ExecutionError::execution_failed("program rejected").is_transient());
        assert!(!ExecutionError::SignerDisconnected.is_transient());
        assert!(
            !ExecutionError::InsufficientFunds {
                required: "1".into(),
                available: "0".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_critical_kinds() {
        assert!(ExecutionError::SignerDisconnected.is_critical());
        assert!(ExecutionError::Critical("db down".into()).is_critical());
        assert!(!ExecutionError::RouteUnavailable("x".into()).is_critical());
    }

    #[test]
    fn test_from_message() {
        assert_eq!(
            ExecutionError::from_message("Wallet disconnected by user"),
            ExecutionError::SignerDisconnected
        );
        assert_eq!(
            ExecutionError::from_message("insufficient balance for transfer").kind(),
            ErrorKind::InsufficientFunds
        );
        assert_eq!(
            ExecutionError::from_message("No route found for pair").kind(),
            ErrorKind::RouteUnavailable
        );
        assert!(ExecutionError::from_message("Blockhash not found").is_transient());
        assert_eq!(
            ExecutionError::from_message("something odd").kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CriticalSystemError).unwrap();
        assert_eq!(json, "\"critical_system_error\"");
    }
}
