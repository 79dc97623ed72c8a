mod fixtures;

use std::path::Path;
use std::sync::Arc;

use rust_decimal_macros::dec;
use tempfile::TempDir;

use fanout_pilot::config::{NotificationConfig, ProjectPaths};
use fanout_pilot::error::PilotError;
use fanout_pilot::external::SimulatedBackends;
use fanout_pilot::notification::Notifier;
use fanout_pilot::session::{
    Backends, PaymentReceipt, SessionController, SessionId, SessionPhase, SessionRequest,
};
use fanout_pilot::storage::{FileStore, SessionStore};

use fixtures::{Harness, PAYER, fast_config};

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

/// A controller over a file store, as a fresh process would build it.
async fn open(data_dir: &Path) -> (SessionController, SimulatedBackends) {
    let config = fast_config();
    let store = Arc::new(FileStore::new(ProjectPaths::new(data_dir)));
    store.init().await.unwrap();
    let sim = SimulatedBackends::new(config.accounts.operating_account.clone(), |router| {
        router.with_yield(dec!(0.05))
    });
    let controller = SessionController::new(
        config,
        Backends::from(&sim),
        store as Arc<dyn SessionStore>,
        Notifier::disabled(),
    )
    .unwrap();
    (controller, sim)
}

#[test]
fn test_resume_after_restart_completes_from_checkpoint() {
    let dir = TempDir::new().unwrap();

    let id: SessionId = paused_runtime().block_on(async {
        let (controller, sim) = open(dir.path()).await;
        let request = SessionRequest::from_defaults(&fast_config().session, PAYER);
        let total = request.total;
        let id = controller.create_session(request).await.unwrap();
        let receipt = sim.pay_in(PAYER, total).await.unwrap();
        controller
            .confirm_payment(&id, PaymentReceipt::new(receipt.correlation_ref, PAYER, total))
            .await
            .unwrap();
        controller.start_session(&id).await.unwrap();
        id
    });
    // The first runtime is gone; its driver died mid-distribution.

    paused_runtime().block_on(async {
        let (controller, sim) = open(dir.path()).await;
        sim.ledger.credit(sim.operating_account(), dec!(1));

        let view = controller.get_session_status(&id).await.unwrap();
        assert_eq!(view.phase, SessionPhase::Distributing);

        controller.resume_session(&id).await.unwrap();
        assert!(matches!(
            controller.resume_session(&id).await,
            Err(PilotError::SessionAlreadyRunning(_))
        ));

        assert_eq!(
            controller.wait_for_terminal(&id).await.unwrap(),
            SessionPhase::Completed
        );
        let report = controller.get_session_report(&id).await.unwrap();
        assert_eq!(report.summary.collected, 10);

        let checkpoints = controller.list_checkpoints(&id).await.unwrap();
        assert_eq!(checkpoints[0].phase, SessionPhase::Completed);
        assert!(checkpoints.iter().any(|cp| cp.reason.starts_with("resumed from")));

        assert!(matches!(
            controller.resume_session(&id).await,
            Err(PilotError::Recovery(_))
        ));
    });
}

#[tokio::test(start_paused = true)]
async fn test_file_store_layout_after_run() {
    let dir = TempDir::new().unwrap();
    let (controller, sim) = open(dir.path()).await;
    let request = SessionRequest::from_defaults(&fast_config().session, PAYER);
    let total = request.total;
    let id = controller.create_session(request).await.unwrap();
    let receipt = sim.pay_in(PAYER, total).await.unwrap();
    controller
        .confirm_payment(&id, PaymentReceipt::new(receipt.correlation_ref, PAYER, total))
        .await
        .unwrap();
    controller.start_session(&id).await.unwrap();
    controller.wait_for_terminal(&id).await.unwrap();

    let paths = ProjectPaths::new(dir.path());
    assert!(paths.sessions_dir.join(format!("{}.yaml", id)).exists());
    assert!(paths.reports_dir.join(format!("{}.json", id)).exists());
    assert!(paths.checkpoints_dir.join(id.as_str()).is_dir());

    // A second controller over the same directory sees the archived session.
    let (reopened, _) = open(dir.path()).await;
    assert_eq!(reopened.list_sessions().await.unwrap(), vec![id.clone()]);
    let report = reopened.get_session_report(&id).await.unwrap();
    assert_eq!(report.summary.final_phase, SessionPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_event_log_records_lifecycle() {
    let dir = TempDir::new().unwrap();
    let notifier = Notifier::new(
        NotificationConfig {
            enabled: true,
            event_log: true,
            hook_command: None,
        },
        Some(dir.path().to_path_buf()),
    );
    let h = Harness::with_notifier(fast_config(), |router| router, notifier);
    let id = h.start(h.request()).await;
    h.controller.wait_for_terminal(&id).await.unwrap();

    let log = std::fs::read_to_string(dir.path().join(format!("{}.log", id))).unwrap();
    let order = [
        "session.created",
        "session.payment_confirmed",
        "session.started",
        "session.phase_changed",
        "session.completed",
    ];
    let mut cursor = 0;
    for event in order {
        let found = log[cursor..]
            .find(event)
            .unwrap_or_else(|| panic!("{} missing after offset {}", event, cursor));
        cursor += found;
    }
    assert!(!log.contains("unit.failed"));
}
