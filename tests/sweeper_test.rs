// Integration tests for the periodic sweep of due Locations

use agora::ids::LocationId;
use agora::location::{PauseReason, UpdateOptions};
use agora::sweeper::{SweepReport, Sweeper};
use agora::test_support::Fixture;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn pause(fx: &Fixture, id: LocationId, offset_secs: Option<i64>) {
    fx.edit_location(id, |l| {
        l.state.pause_update_until = offset_secs.map(|s| Utc::now() + ChronoDuration::seconds(s));
        l.state.pause_reason = PauseReason::ScheduledPause;
    });
}

/// Only Locations whose pause has elapsed are updated.
#[tokio::test]
async fn test_sweep_updates_due_locations_only() {
    let fx = Fixture::new();
    let due = fx.seed_location(1, "round_robin", &[1]);
    let later = fx.seed_location(2, "round_robin", &[2]);
    let parked = fx.seed_location(3, "round_robin", &[3]);
    pause(&fx, due, Some(-1));
    pause(&fx, later, Some(60));
    pause(&fx, parked, None);
    let sweeper = Sweeper::new(Arc::new(fx.updater()));

    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            due: 1,
            updated: 1,
            busy: 0,
            failed: 0,
        }
    );
    assert_eq!(fx.store.messages(due).len(), 1);
    assert!(fx.store.messages(later).is_empty());
    assert!(fx.store.messages(parked).is_empty());
}

/// A Location whose lock is held is left for a later sweep.
#[tokio::test(start_paused = true)]
async fn test_sweep_skips_busy_location() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    pause(&fx, location_id, Some(-1));
    fx.agent_core.set_hold(Duration::from_millis(200));
    let updater = Arc::new(fx.updater());

    let running = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update_location(None, location_id, UpdateOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = Sweeper::new(Arc::clone(&updater)).sweep_once().await.unwrap();
    assert_eq!((report.due, report.busy, report.updated), (1, 1, 0));

    running.await.unwrap().unwrap();
    assert_eq!(fx.agent_core.runs().len(), 1);
}

/// Failed cycles are counted and leave the Location paused with UPDATE_ERROR.
#[tokio::test]
async fn test_sweep_counts_failures() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    pause(&fx, location_id, Some(-1));
    fx.agent_core.set_fail(true);
    let sweeper = Sweeper::new(Arc::new(fx.updater()));

    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!((report.due, report.failed), (1, 1));

    let state = fx.store.location(location_id).unwrap().state;
    assert_eq!(state.pause_reason, PauseReason::UpdateError);
    assert_eq!(state.pause_update_until, None);
    // Not due anymore
    assert_eq!(sweeper.sweep_once().await.unwrap().due, 0);
}

/// The loop sweeps on its first tick and exits when signalled.
#[tokio::test(start_paused = true)]
async fn test_run_stops_on_signal() {
    let fx = Fixture::new().configure(|c| c.sweeper.interval_ms = 100);
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    pause(&fx, location_id, Some(-1));
    let sweeper = Arc::new(Sweeper::new(Arc::new(fx.updater())));

    let (tx, rx) = watch::channel(false);
    let handle = {
        let sweeper = Arc::clone(&sweeper);
        tokio::spawn(async move { sweeper.run(rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.agent_core.runs().len(), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
