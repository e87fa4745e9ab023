use super::*;
use super::model::Item;
use crate::error::{DomainStateError, LockAcquisitionError};
use crate::ids::{AgentId, ItemId, LocationId};
use crate::repository::{ItemRepository, Repositories};
use crate::test_support::Fixture;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn forced() -> UpdateOptions {
    UpdateOptions {
        ignore_pause_update_until: true,
        ..Default::default()
    }
}

fn ids(raw: &[i64]) -> Vec<AgentId> {
    raw.iter().copied().map(AgentId).collect()
}

struct CountingSaves(AtomicUsize);

#[async_trait]
impl SaveHandler for CountingSaves {
    async fn handle_save(&self, save: BoxFuture<'static, anyhow::Result<()>>) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        save.await
    }
}

/// Item storage that cannot be read.
struct BrokenItems(Arc<crate::repository::InMemoryStore>);

#[async_trait]
impl ItemRepository for BrokenItems {
    async fn list_by_location(&self, _location_id: LocationId) -> anyhow::Result<Vec<Item>> {
        Err(anyhow!("item table unavailable"))
    }

    async fn add(&self, item: Item) -> anyhow::Result<()> {
        ItemRepository::add(self.0.as_ref(), item).await
    }

    async fn remove(&self, id: ItemId) -> anyhow::Result<()> {
        ItemRepository::remove(self.0.as_ref(), id).await
    }

    async fn transfer(&self, id: ItemId, owner: Option<crate::ids::EntityKey>) -> anyhow::Result<()> {
        ItemRepository::transfer(self.0.as_ref(), id, owner).await
    }
}

#[tokio::test]
async fn test_round_robin_runs_least_recent_agent() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1, 2, 3]);
    let updater = fx.updater();

    for _ in 0..4 {
        updater.update_location(None, location_id, forced()).await.unwrap();
    }

    assert_eq!(fx.agent_core.runs(), ids(&[1, 2, 3, 1]));
    assert_eq!(fx.store.messages(location_id).len(), 4);
}

#[tokio::test]
async fn test_round_robin_schedules_next_cycle_after_acting() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let updater = fx.updater();

    let before = Utc::now();
    let snapshot = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    let state = snapshot.state();
    assert_eq!(state.pause_reason, PauseReason::ScheduledPause);
    let until = state.pause_update_until.unwrap();
    assert!(until >= before + ChronoDuration::milliseconds(5_000));
    assert_eq!(fx.store.location(location_id).unwrap().state, *state);
}

#[tokio::test]
async fn test_nobody_willing_completes_without_wakeup() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1, 2]);
    fx.agent_core.set_wants_to_act(false);
    let updater = fx.updater();

    let snapshot = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    assert!(fx.agent_core.runs().is_empty());
    assert_eq!(snapshot.state().pause_reason, PauseReason::UpdateCompleted);
    assert_eq!(snapshot.state().pause_update_until, None);
}

#[tokio::test]
async fn test_repeat_all_runs_everyone_once() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "repeat_all", &[3, 1, 2]);
    let updater = fx.updater();

    updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    // Location order, not id order
    assert_eq!(fx.agent_core.runs(), ids(&[3, 1, 2]));
    for id in [1, 2, 3] {
        assert!(fx.store.agent(AgentId(id)).unwrap().last_executed_at.is_some());
    }
}

#[tokio::test]
async fn test_update_until_idle_stops_at_round_limit() {
    let fx = Fixture::new().configure(|c| c.location.until_idle_max_rounds = 2);
    let location_id = fx.seed_location(1, "update_until_idle", &[1, 2]);
    let updater = fx.updater();

    updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    assert_eq!(fx.agent_core.runs(), ids(&[1, 2, 1, 2]));
}

#[tokio::test]
async fn test_execution_budget_is_charged_and_enforced() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "update_until_idle", &[1, 2]);
    fx.edit_location(location_id, |l| l.state.remaining_agent_executions = Some(3));
    let updater = fx.updater();

    updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(fx.agent_core.runs(), ids(&[1, 2, 1]));
    assert_eq!(
        fx.store.location(location_id).unwrap().state.remaining_agent_executions,
        Some(0)
    );

    let snapshot = updater.update_location(None, location_id, forced()).await.unwrap();
    assert_eq!(fx.agent_core.runs().len(), 3);
    assert_eq!(snapshot.state().pause_reason, PauseReason::NoAgentExecutions);
    assert_eq!(snapshot.state().pause_update_until, None);
}

#[tokio::test]
async fn test_location_without_active_agents_pauses_indefinitely() {
    let fx = Fixture::new();
    let empty = fx.seed_location(1, "round_robin", &[]);
    let dormant = fx.seed_location(2, "round_robin", &[5]);
    let mut agent = fx.store.agent(AgentId(5)).unwrap();
    agent.active = false;
    fx.store.insert_agent(agent);
    let updater = fx.updater();

    for location_id in [empty, dormant] {
        let snapshot = updater
            .update_location(None, location_id, UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(snapshot.state().pause_reason, PauseReason::NoAgents);
        assert_eq!(snapshot.state().pause_update_until, None);
        assert_eq!(fx.store.location(location_id).unwrap().state.pause_reason, PauseReason::NoAgents);
    }
    assert!(fx.agent_core.runs().is_empty());
}

#[tokio::test]
async fn test_future_pause_is_a_no_op_unless_ignored() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let until = Utc::now() + ChronoDuration::seconds(60);
    fx.edit_location(location_id, |l| {
        l.state.pause_update_until = Some(until);
        l.state.pause_reason = PauseReason::ScheduledPause;
    });
    let updater = fx.updater();

    let snapshot = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();
    assert!(fx.agent_core.runs().is_empty());
    assert_eq!(snapshot.state().pause_update_until, Some(until));
    assert_eq!(fx.store.location(location_id).unwrap().state.pause_update_until, Some(until));

    updater.update_location(None, location_id, forced()).await.unwrap();
    assert_eq!(fx.agent_core.runs(), ids(&[1]));
}

#[tokio::test]
async fn test_failed_cycle_records_update_error() {
    let fx = Fixture::new().configure(|c| c.location.error_retry_delay_ms = Some(30_000));
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    fx.agent_core.set_fail(true);
    let updater = fx.updater();

    let err = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scripted agent failed"));

    let state = fx.store.location(location_id).unwrap().state;
    assert_eq!(state.pause_reason, PauseReason::UpdateError);
    assert!(state.pause_update_until.unwrap() > Utc::now() + ChronoDuration::seconds(20));
}

#[tokio::test]
async fn test_panicking_agent_is_contained() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    fx.agent_core.set_panic(true);
    let updater = fx.updater();

    let err = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("panicked"));

    let state = fx.store.location(location_id).unwrap().state;
    assert_eq!(state.pause_reason, PauseReason::UpdateError);
    assert_eq!(state.pause_update_until, None);

    // The lock was released despite the panic
    fx.agent_core.set_panic(false);
    updater.update_location(None, location_id, forced()).await.unwrap();
}

#[tokio::test]
async fn test_hydration_failure_records_update_error() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let repos = Repositories {
        items: Arc::new(BrokenItems(Arc::clone(&fx.store))),
        ..fx.repositories()
    };
    let updater = fx.updater_from(repos, fx.registry());

    let err = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("item table unavailable"));
    assert_eq!(
        fx.store.location(location_id).unwrap().state.pause_reason,
        PauseReason::UpdateError
    );
    assert!(fx.agent_core.runs().is_empty());
}

#[tokio::test]
async fn test_persisted_resume_agent_runs_first() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1, 2, 3]);
    fx.edit_location(location_id, |l| {
        l.state.pause_update_until = Some(Utc::now() - ChronoDuration::seconds(1));
        l.state.pause_reason = PauseReason::GimmickExecuted;
        l.state.resume_agent_id = Some(AgentId(3));
    });
    let updater = fx.updater();

    let snapshot = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    assert_eq!(fx.agent_core.runs(), ids(&[3]));
    assert_eq!(snapshot.state().pause_reason, PauseReason::ScheduledPause);
    assert_eq!(snapshot.state().resume_agent_id, None);
}

#[tokio::test]
async fn test_resume_option_skips_condition_and_ignores_strangers() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1, 2]);
    fx.agent_core.set_wants_to_act(false);
    let updater = fx.updater();

    let opts = UpdateOptions {
        resume_agent: Some(AgentId(2)),
        ..Default::default()
    };
    updater.update_location(None, location_id, opts).await.unwrap();
    assert_eq!(fx.agent_core.runs(), ids(&[2]));

    // Not part of the Location: the strategy runs instead
    let opts = UpdateOptions {
        ignore_pause_update_until: true,
        resume_agent: Some(AgentId(9)),
    };
    let snapshot = updater.update_location(None, location_id, opts).await.unwrap();
    assert_eq!(fx.agent_core.runs(), ids(&[2]));
    assert_eq!(snapshot.state().pause_reason, PauseReason::UpdateCompleted);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_updates_contend_for_the_lock() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    fx.agent_core.set_hold(Duration::from_millis(200));
    let updater = Arc::new(fx.updater());

    let first = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update_location(None, location_id, UpdateOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let skipped = updater
        .update_location_no_retry(None, location_id, UpdateOptions::default())
        .await
        .unwrap();
    assert!(skipped.is_none());

    // Three 10ms retries run out long before the hold ends
    let err = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<LockAcquisitionError>().is_some());

    first.await.unwrap().unwrap();
    assert_eq!(fx.agent_core.runs(), ids(&[1]));
}

#[tokio::test]
async fn test_no_retry_updates_free_location() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let updater = fx.updater();

    let snapshot = updater
        .update_location_no_retry(None, location_id, UpdateOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.agent_ids, ids(&[1]));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_update_releases_location_lock() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    fx.agent_core.set_hold(Duration::from_secs(10));
    let updater = Arc::new(fx.updater());

    let running = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update_location(None, location_id, forced()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.agent_core.runs(), ids(&[1]));

    running.abort();
    assert!(running.await.unwrap_err().is_cancelled());

    // Well before the lock's TTL
    fx.agent_core.set_hold(Duration::ZERO);
    let snapshot = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Some(snapshot) = updater
                .update_location_no_retry(None, location_id, forced())
                .await
                .unwrap()
            {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("location lock was not released");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(fx.agent_core.runs(), ids(&[1, 1]));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_gives_up_after_drain_timeout() {
    let fx = Fixture::new().configure(|c| c.shutdown.drain_timeout_ms = 1_000);
    let updater = fx.updater();
    let _stuck = fx.operations.track();

    let started = tokio::time::Instant::now();
    assert!(!updater.shutdown().await);
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert!(fx.operations.is_shutting_down());
}

#[tokio::test]
async fn test_updates_rejected_during_shutdown() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let updater = fx.updater();
    assert!(fx.operations.shutdown(Duration::from_millis(10)).await);

    let err = updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<DomainStateError>(), Some(&DomainStateError::ShuttingDown));
    assert!(fx.agent_core.runs().is_empty());
}

#[tokio::test]
async fn test_custom_save_handler_sees_every_write() {
    let fx = Fixture::new();
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    let handler = Arc::new(CountingSaves(AtomicUsize::new(0)));
    let updater = fx.updater().with_save_handler(handler.clone());

    updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();

    // Message, execution stamp and pause
    assert_eq!(handler.0.load(Ordering::SeqCst), 3);
    assert_eq!(fx.store.messages(location_id).len(), 1);
    assert_eq!(fx.operations.active(), 0);
}

#[tokio::test]
async fn test_location_updates_only_carry_that_location() {
    let fx = Fixture::new();
    let watched = fx.seed_location(1, "round_robin", &[1]);
    let other = fx.seed_location(2, "round_robin", &[2]);
    let updater = fx.updater();
    let updates = updater.location_updates(watched);
    tokio::pin!(updates);

    updater.update_location(None, other, UpdateOptions::default()).await.unwrap();
    updater.update_location(None, watched, UpdateOptions::default()).await.unwrap();

    let first = updates.next().await.unwrap();
    assert_eq!(first.location_id, watched);
    assert_eq!(first.event.name(), "message_added");
}
