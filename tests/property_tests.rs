mod fixtures;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fanout_pilot::session::{PROGRESS_CEILING, SessionPhase, UnitPhase};
use fanout_pilot::storage::SessionStore;

use fixtures::Harness;

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_capped_until_completed() {
    let h = Harness::new();
    let id = h.start(h.request()).await;

    let mut samples = Vec::new();
    loop {
        let view = h.controller.get_session_status(&id).await.unwrap();
        samples.push((view.phase, view.progress));
        if view.phase.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for pair in samples.windows(2) {
        assert!(
            pair[1].1 >= pair[0].1,
            "progress went backwards: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
    for (phase, progress) in &samples {
        if *phase != SessionPhase::Completed {
            assert!(*progress <= PROGRESS_CEILING);
        }
    }
    assert_eq!(samples.last().copied(), Some((SessionPhase::Completed, 100.0)));
}

#[tokio::test(start_paused = true)]
async fn test_collection_starts_after_every_activation() {
    let h = Harness::new();
    let id = h.start(h.request()).await;
    h.controller.wait_for_terminal(&id).await.unwrap();

    let checkpoint = h.store.latest_checkpoint(&id).await.unwrap().unwrap();
    let activations: Vec<_> = checkpoint
        .unit_states
        .iter()
        .flat_map(|u| u.outcomes.iter())
        .filter(|o| o.phase == UnitPhase::Activation)
        .map(|o| o.at)
        .collect();
    let collections: Vec<_> = checkpoint
        .unit_states
        .iter()
        .flat_map(|u| u.outcomes.iter())
        .filter(|o| o.phase == UnitPhase::Collection)
        .map(|o| o.at)
        .collect();
    assert_eq!(activations.len(), 10);
    assert_eq!(collections.len(), 10);

    let last_activation = activations.iter().max().unwrap();
    let first_collection = collections.iter().min().unwrap();
    assert!(last_activation <= first_collection);
}

#[tokio::test(start_paused = true)]
async fn test_generated_batch_respects_bounds_and_windows() {
    let h = Harness::new();
    let request = h.request().with_bounds(dec!(0.016), dec!(0.048));
    let id = h.start(request).await;

    let batch = h.store.load_batch(&id).await.unwrap();
    assert_eq!(batch.units.len(), 10);

    let total: Decimal = batch.units.iter().map(|u| u.amount).sum();
    assert_eq!(total, dec!(0.30));
    for unit in &batch.units {
        assert!(unit.amount >= dec!(0.016) && unit.amount <= dec!(0.048));
        assert!(unit.event(UnitPhase::Activation).offset() < Duration::from_secs(10));
        assert!(unit.event(UnitPhase::Collection).offset() < Duration::from_secs(5));
    }

    let mut handles: Vec<_> = batch.units.iter().map(|u| u.handle.clone()).collect();
    handles.sort();
    handles.dedup();
    assert_eq!(handles.len(), 10);

    h.controller.wait_for_terminal(&id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_archived_report_export_is_stable() {
    let h = Harness::new();
    let id = h.start(h.request()).await;
    h.controller.wait_for_terminal(&id).await.unwrap();

    let first = h.controller.export_session_report(&id).await.unwrap();
    let second = h.controller.export_session_report(&id).await.unwrap();
    assert_eq!(first, second);

    let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(parsed["summary"]["session_id"], id.as_str());
    assert_eq!(parsed["units"].as_array().map(|u| u.len()), Some(10));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_are_isolated() {
    let h = Harness::new().with_reserve(dec!(1));
    let first = h.start(h.request()).await;
    let second = h.start(h.request().with_total(dec!(0.40))).await;
    assert_ne!(first, second);

    let (a, b) = tokio::join!(
        h.controller.wait_for_terminal(&first),
        h.controller.wait_for_terminal(&second)
    );
    assert_eq!(a.unwrap(), SessionPhase::Completed);
    assert_eq!(b.unwrap(), SessionPhase::Completed);

    let a = h.controller.get_session_report(&first).await.unwrap();
    let b = h.controller.get_session_report(&second).await.unwrap();
    assert_eq!(a.summary.total, dec!(0.30));
    assert_eq!(b.summary.total, dec!(0.40));
    assert!(a.units.iter().all(|u| u.handle.starts_with(first.as_str())));
    assert!(b.units.iter().all(|u| u.handle.starts_with(second.as_str())));
    assert_eq!(h.controller.list_sessions().await.unwrap().len(), 2);
}
