use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{PilotError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub session: SessionDefaults,
    pub allocation: AllocationConfig,
    pub execution: ExecutionConfig,
    pub recovery: RecoveryConfig,
    pub accounts: AccountsConfig,
    pub metrics: MetricsConfig,
    pub notification: NotificationConfig,
}

impl PilotConfig {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        self.validate()?;
        fs::create_dir_all(data_dir).await?;
        let config_path = data_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| PilotError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.session.unit_count == 0 {
            errors.push("session.unit_count must be greater than 0");
        }
        if self.session.activation_window_secs == 0 {
            errors.push("session.activation_window_secs must be greater than 0");
        }
        if self.session.collection_window_secs == 0 {
            errors.push("session.collection_window_secs must be greater than 0");
        }
        if self.session.min_unit_amount <= Decimal::ZERO {
            errors.push("session.min_unit_amount must be positive");
        }
        if self.session.min_unit_amount > self.session.max_unit_amount {
            errors.push("session.min_unit_amount must not exceed max_unit_amount");
        }

        if self.allocation.amount_precision > 18 {
            errors.push("allocation.amount_precision must be at most 18");
        }
        if self.allocation.max_draw_attempts == 0 {
            errors.push("allocation.max_draw_attempts must be greater than 0");
        }

        if self.execution.retry_base_delay_ms == 0 {
            errors.push("execution.retry_base_delay_ms must be greater than 0");
        }
        if self.execution.retry_max_delay_ms < self.execution.retry_base_delay_ms {
            errors.push("execution.retry_max_delay_ms must be >= retry_base_delay_ms");
        }
        if self.execution.call_timeout_secs == 0 {
            errors.push("execution.call_timeout_secs must be greater than 0");
        }
        if self.execution.max_concurrent_units == 0 {
            errors.push("execution.max_concurrent_units must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.recovery.failure_rate_refund_threshold) {
            errors.push("recovery.failure_rate_refund_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=100.0).contains(&self.recovery.early_failure_progress_threshold) {
            errors.push("recovery.early_failure_progress_threshold must be between 0 and 100");
        }

        if self.accounts.operating_account.trim().is_empty() {
            errors.push("accounts.operating_account must not be empty");
        }

        if self.metrics.recent_refs_capacity == 0 {
            errors.push("metrics.recent_refs_capacity must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PilotError::Config(errors.join("; ")))
        }
    }
}

/// Defaults applied when a session request leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    pub total: Decimal,
    pub unit_count: usize,
    pub activation_window_secs: u64,
    pub collection_window_secs: u64,
    pub min_unit_amount: Decimal,
    pub max_unit_amount: Decimal,
    pub profit_target: Option<Decimal>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            total: dec!(3.20),
            unit_count: 100,
            activation_window_secs: 26 * 60,
            collection_window_secs: 60,
            min_unit_amount: dec!(0.016),
            max_unit_amount: dec!(0.048),
            profit_target: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Decimal places of the rounding unit applied to every share.
    pub amount_precision: u32,
    /// Redraws allowed when a residual share falls outside the bounds.
    pub max_draw_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            amount_precision: 6,
            max_draw_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Retries after the first attempt of a unit activation or collection.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub call_timeout_secs: u64,
    pub max_concurrent_units: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            call_timeout_secs: 30,
            max_concurrent_units: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Failure ratio (0.0-1.0) across executed units above which the payment is refunded.
    pub failure_rate_refund_threshold: f64,
    /// Progress percentage below which a failure triggers session recovery.
    pub early_failure_progress_threshold: f64,
    pub max_recovery_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_rate_refund_threshold: 0.70,
            early_failure_progress_threshold: 25.0,
            max_recovery_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Account that receives upfront payments and funds activations.
    pub operating_account: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            operating_account: "operating".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub recent_refs_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            recent_refs_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub event_log: bool,
    /// Shell command run for every session event, with the event in the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_command: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_log: true,
            hook_command: None,
        }
    }
}

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub refunds_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            sessions_dir: data_dir.join("sessions"),
            checkpoints_dir: data_dir.join("checkpoints"),
            refunds_dir: data_dir.join("refunds"),
            reports_dir: data_dir.join("reports"),
            logs_dir: data_dir.join("logs"),
            data_dir,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.sessions_dir,
            &self.checkpoints_dir,
            &self.refunds_dir,
            &self.reports_dir,
            &self.logs_dir,
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PilotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = PilotConfig::default();
        config.session.unit_count = 0;
        config.recovery.failure_rate_refund_threshold = 1.5;
        config.execution.max_concurrent_units = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unit_count"));
        assert!(err.contains("failure_rate_refund_threshold"));
        assert!(err.contains("max_concurrent_units"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_thresholds() {
        let config = PilotConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: PilotConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.execution.max_retries, 3);
        assert!((parsed.recovery.failure_rate_refund_threshold - 0.70).abs() < f64::EPSILON);
        assert_eq!(parsed.session.total, dec!(3.20));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: PilotConfig = toml::from_str("[execution]\nmax_retries = 5\n").unwrap();
        assert_eq!(parsed.execution.max_retries, 5);
        assert_eq!(parsed.execution.retry_base_delay_ms, 500);
        assert_eq!(parsed.accounts.operating_account, "operating");
    }
}
