// Integration tests for the Location update cycle across gimmicks, locks and shutdown

use agora::ids::{AgentId, LocationId};
use agora::location::{PauseReason, UpdateOptions};
use agora::sweeper::Sweeper;
use agora::test_support::Fixture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn forced() -> UpdateOptions {
    UpdateOptions {
        ignore_pause_update_until: true,
        ..Default::default()
    }
}

async fn wait_idle(fx: &Fixture) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fx.operations.active() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("background work did not finish");
}

/// An agent that uses a gimmick is resumed once the gimmick is done.
#[tokio::test]
async fn test_gimmick_use_resumes_agent_on_next_sweep() {
    let fx = Fixture::new().configure(|c| c.gimmick.reschedule_delay_ms = 0);
    let location_id = fx.seed_location(1, "round_robin", &[]);
    fx.seed_agent(location_id, 1, "llm_tools");
    fx.seed_user(location_id, 7, "Uma");
    fx.seed_gimmick(location_id, 10, "dice");
    let updater = Arc::new(fx.updater());

    fx.llm.push_tool_calls(json!([{
        "name": "use_gimmick",
        "arguments": { "gimmickId": 10, "params": { "count": 1, "sides": 6 } },
    }]));
    updater
        .update_location(None, location_id, UpdateOptions::default())
        .await
        .unwrap();
    wait_idle(&fx).await;

    let state = fx.store.location(location_id).unwrap().state;
    assert_eq!(state.pause_reason, PauseReason::GimmickExecuted);
    assert_eq!(state.resume_agent_id, Some(AgentId(1)));
    assert!(fx.store.messages(location_id).last().unwrap().message.as_deref().unwrap().contains("rolled 1d6"));

    // The agent would not act on its own: nobody else spoke since its turn
    fx.llm.push_tool_calls(json!([{ "name": "send_message", "arguments": { "message": "A six!" } }]));
    let report = Sweeper::new(Arc::clone(&updater)).sweep_once().await.unwrap();
    assert_eq!((report.due, report.updated), (1, 1));

    let messages = fx.store.messages(location_id);
    assert_eq!(messages.last().unwrap().message.as_deref(), Some("A six!"));
    let state = fx.store.location(location_id).unwrap().state;
    assert_eq!(state.pause_reason, PauseReason::ScheduledPause);
    assert_eq!(state.resume_agent_id, None);
    assert_eq!(fx.llm.requests().len(), 2);
}

/// Blocking callers queue on the Location's lock and run one after another.
#[tokio::test(start_paused = true)]
async fn test_blocking_updates_serialize() {
    let fx = Fixture::new().configure(|c| c.lock.retry_count = 50);
    let location_id = fx.seed_location(1, "round_robin", &[1, 2]);
    fx.agent_core.set_hold(Duration::from_millis(100));
    let updater = Arc::new(fx.updater());

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move { updater.update_location(None, location_id, forced()).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // The second cycle saw the first one's execution stamp
    assert_eq!(fx.agent_core.runs(), vec![AgentId(1), AgentId(2)]);
    let texts: Vec<_> = fx
        .store
        .messages(location_id)
        .into_iter()
        .filter_map(|m| m.message)
        .collect();
    assert_eq!(texts, vec!["turn 1", "turn 2"]);
}

/// Shutdown waits for the running cycle and refuses new ones.
#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_running_cycle() {
    let fx = Fixture::new().configure(|c| c.shutdown.drain_timeout_ms = 5_000);
    let location_id = fx.seed_location(1, "round_robin", &[1]);
    fx.agent_core.set_hold(Duration::from_millis(200));
    let updater = Arc::new(fx.updater());

    let running = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.update_location(None, location_id, UpdateOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fx.operations.active() > 0);

    assert!(updater.shutdown().await);
    running.await.unwrap().unwrap();
    assert_eq!(fx.store.messages(location_id).len(), 1);
    assert_eq!(
        fx.store.location(location_id).unwrap().state.pause_reason,
        PauseReason::ScheduledPause
    );

    let other = fx.seed_location(2, "round_robin", &[2]);
    assert!(updater.update_location(None, other, UpdateOptions::default()).await.is_err());
    assert_eq!(fx.store.location(LocationId(2)).unwrap().state.pause_update_until, None);
}
