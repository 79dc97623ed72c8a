//! Configuration types and loading.
//!
//! `PilotConfig` is read from `<data_dir>/config.toml`; every section falls back
//! to defaults so a partial file is valid.

mod settings;

pub use settings::{
    AccountsConfig, AllocationConfig, ExecutionConfig, MetricsConfig, NotificationConfig,
    PilotConfig, ProjectPaths, RecoveryConfig, SessionDefaults,
};
