use rust_decimal_macros::dec;
use tempfile::TempDir;

use fanout_pilot::config::{PilotConfig, ProjectPaths};
use fanout_pilot::error::{ErrorKind, PilotError};

#[test]
fn test_default_config() {
    let config = PilotConfig::default();

    assert_eq!(config.session.total, dec!(3.20));
    assert_eq!(config.session.unit_count, 100);
    assert_eq!(config.session.activation_window_secs, 26 * 60);
    assert_eq!(config.session.collection_window_secs, 60);
    assert_eq!(config.session.min_unit_amount, dec!(0.016));
    assert_eq!(config.session.max_unit_amount, dec!(0.048));

    assert_eq!(config.execution.max_retries, 3);
    assert_eq!(config.execution.max_concurrent_units, 16);

    assert!((config.recovery.failure_rate_refund_threshold - 0.70).abs() < f64::EPSILON);
    assert!((config.recovery.early_failure_progress_threshold - 25.0).abs() < f64::EPSILON);
    assert_eq!(config.recovery.max_recovery_attempts, 2);

    assert_eq!(config.accounts.operating_account, "operating");

    assert!(config.notification.enabled);
    assert!(config.notification.event_log);
    assert!(config.notification.hook_command.is_none());
}

#[tokio::test]
async fn test_load_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(config.session.unit_count, 100);
}

#[tokio::test]
async fn test_partial_file_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[session]\nunit_count = 20\n\n[recovery]\nmax_recovery_attempts = 5\n",
    )
    .unwrap();

    let config = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(config.session.unit_count, 20);
    assert_eq!(config.recovery.max_recovery_attempts, 5);
    assert_eq!(config.session.collection_window_secs, 60);
    assert_eq!(config.execution.max_retries, 3);
}

#[tokio::test]
async fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[recovery]\nfailure_rate_refund_threshold = 1.5\n",
    )
    .unwrap();

    let err = PilotConfig::load(dir.path()).await.unwrap_err();
    assert!(matches!(err, PilotError::Config(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert!(err.to_string().contains("failure_rate_refund_threshold"));
}

#[tokio::test]
async fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let mut config = PilotConfig::default();
    config.session.profit_target = Some(dec!(0.15));
    config.accounts.operating_account = "treasury".into();
    config.save(dir.path()).await.unwrap();

    let loaded = PilotConfig::load(dir.path()).await.unwrap();
    assert_eq!(loaded.session.profit_target, Some(dec!(0.15)));
    assert_eq!(loaded.accounts.operating_account, "treasury");
}

#[tokio::test]
async fn test_save_refuses_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = PilotConfig::default();
    config.session.min_unit_amount = dec!(0.05);
    config.session.max_unit_amount = dec!(0.01);

    assert!(config.save(dir.path()).await.is_err());
    assert!(!dir.path().join("config.toml").exists());
}

#[tokio::test]
async fn test_project_paths_ensure_dirs() {
    let dir = TempDir::new().unwrap();
    let paths = ProjectPaths::new(dir.path().join("data"));
    paths.ensure_dirs().await.unwrap();

    for sub in [
        &paths.sessions_dir,
        &paths.checkpoints_dir,
        &paths.refunds_dir,
        &paths.reports_dir,
        &paths.logs_dir,
    ] {
        assert!(sub.is_dir(), "{} missing", sub.display());
    }
}
