use super::{GimmickContext, GimmickCore, GimmickLeases, GimmickOutcome, GimmickState, Occupation};
use crate::config::GimmickConfig;
use crate::error::DomainStateError;
use crate::ids::{EntityKey, GimmickId, LocationId};
use crate::location::cycle::{LocationCycle, Rescheduler};
use crate::location::effects::EffectSink;
use crate::location::events::LocationEvent;
use crate::location::model::{time_after, LocationMessage, PauseReason, PauseUpdate};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// A request to run a gimmick's effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub executor: EntityKey,
    pub params: Value,
    pub reason: Option<String>,
    /// Take the gimmick even while someone else occupies it
    pub force: bool,
    /// Resume the executing agent shortly after completion
    pub reschedule: bool,
}

impl ExecuteRequest {
    pub fn new(executor: EntityKey, params: Value) -> Self {
        Self {
            executor,
            params,
            reason: None,
            force: false,
            reschedule: true,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn without_reschedule(mut self) -> Self {
        self.reschedule = false;
        self
    }
}

/// Occupy a gimmick and start its effect in the background.
///
/// Fails with [`DomainStateError::GimmickOccupied`] while the gimmick is
/// occupied, by the executor itself included, unless the request is forced.
/// The returned handle
/// finishes once the gimmick is released and its outcome persisted.
pub fn execute(
    cycle: &mut LocationCycle,
    gimmick_id: GimmickId,
    request: ExecuteRequest,
) -> Result<JoinHandle<()>> {
    let gimmick = cycle
        .gimmick(gimmick_id)
        .ok_or(DomainStateError::EntityNotFound(EntityKey::gimmick(gimmick_id)))?;

    if let Occupation::Occupied { occupier, .. } = gimmick.occupation(cycle.now()) {
        if !request.force {
            return Err(DomainStateError::GimmickOccupied {
                gimmick: gimmick_id,
                occupier,
            }
            .into());
        }
    }
    let core = cycle.registry().gimmick_core(&gimmick.core)?;

    cycle.renew_gimmick(gimmick_id, request.executor, request.reason.clone())?;
    cycle.emit(LocationEvent::GimmickExecuting {
        gimmick_id,
        executor: request.executor,
        reason: request.reason.clone(),
    });

    let gimmick = cycle
        .gimmick(gimmick_id)
        .ok_or(DomainStateError::EntityNotFound(EntityKey::gimmick(gimmick_id)))?;
    info!(
        location_id = %cycle.location_id(),
        gimmick_id = %gimmick_id,
        executor = %request.executor,
        core = core.name(),
        "Gimmick execution started"
    );

    let run = Execution {
        ctx: GimmickContext {
            location_id: cycle.location_id(),
            gimmick,
            executor: request.executor,
            reason: request.reason,
            llm: Arc::clone(cycle.llm()),
            llm_options: cycle.llm_options(),
        },
        core,
        params: request.params,
        reschedule: request.reschedule,
        sink: cycle.sink().clone(),
        leases: cycle.gimmick_leases().clone(),
        rescheduler: cycle.rescheduler(),
        config: cycle.config().gimmick.clone(),
    };
    let guard = cycle.operations().track();

    Ok(tokio::spawn(async move {
        let _guard = guard;
        run.run().await;
    }))
}

/// Everything the background task owns.
struct Execution {
    ctx: GimmickContext,
    core: Arc<dyn GimmickCore>,
    params: Value,
    reschedule: bool,
    sink: EffectSink,
    leases: GimmickLeases,
    rescheduler: Rescheduler,
    config: GimmickConfig,
}

impl Execution {
    fn location_id(&self) -> LocationId {
        self.ctx.location_id
    }

    fn gimmick_id(&self) -> GimmickId {
        self.ctx.gimmick.id
    }

    async fn run(self) {
        let result = self.run_effect().await;
        let gimmick_id = self.gimmick_id();
        let executor = self.ctx.executor;

        self.leases.release(gimmick_id);
        self.sink.emit(LocationEvent::GimmickReleased { gimmick_id });

        let reason = match result {
            Ok(outcome) => {
                info!(location_id = %self.location_id(), gimmick_id = %gimmick_id, "Gimmick execution finished");
                self.sink.emit(LocationEvent::GimmickExecuted { gimmick_id, executor });
                if let Some(text) = outcome.message {
                    let message = LocationMessage::new(
                        self.location_id(),
                        Some(self.ctx.gimmick.key()),
                        &self.ctx.gimmick.name,
                        Utc::now(),
                    )
                    .with_message(text);
                    self.sink.emit(LocationEvent::MessageAdded { message });
                }
                PauseReason::GimmickExecuted
            }
            Err(e) => {
                warn!(location_id = %self.location_id(), gimmick_id = %gimmick_id, error = %e, "Gimmick execution failed");
                self.sink.emit(LocationEvent::GimmickExecutionFailed {
                    gimmick_id,
                    executor,
                    error: e.to_string(),
                });
                let message = LocationMessage::system(
                    self.location_id(),
                    format!("{} failed: {}", self.ctx.gimmick.name, e),
                    Utc::now(),
                );
                self.sink.emit(LocationEvent::MessageAdded { message });
                PauseReason::GimmickExecutionFailed
            }
        };

        if self.reschedule {
            if let Some(agent_id) = executor.as_agent() {
                self.rescheduler
                    .reschedule(PauseUpdate {
                        until: Some(time_after(Utc::now(), self.config.reschedule_delay())),
                        reason,
                        resume_agent_id: Some(agent_id),
                    })
                    .await;
            }
        }

        self.sink.flush().await;
    }

    /// Race the core's effect against the timeout while renewing the lease.
    async fn run_effect(&self) -> Result<GimmickOutcome> {
        let effect = AssertUnwindSafe(self.core.execute(&self.ctx, self.params.clone())).catch_unwind();
        tokio::pin!(effect);

        let timeout = self.config.execution_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let period = self.config.heartbeat_interval().max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_enabled = self.config.heartbeat_interval_ms > 0;
        let threshold = self.config.heartbeat_failure_threshold;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                result = &mut effect => {
                    return result.unwrap_or_else(|_| Err(anyhow!("gimmick core '{}' panicked", self.core.name())));
                }
                _ = &mut deadline => {
                    bail!("execution timed out after {}ms", timeout.as_millis());
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    match self.renew_lease().await {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            warn!(
                                location_id = %self.location_id(),
                                gimmick_id = %self.gimmick_id(),
                                failures,
                                error = %e,
                                "Gimmick lease renewal failed"
                            );
                            if threshold > 0 && failures >= threshold {
                                bail!("lease renewal failed {} times in a row", failures);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn renew_lease(&self) -> Result<()> {
        let state = GimmickState {
            occupier: Some(self.ctx.executor),
            occupation_until: Some(time_after(Utc::now(), self.config.default_occupation())),
            occupation_reason: self.ctx.reason.clone(),
        };
        self.leases.set(self.gimmick_id(), state.clone());
        self.sink
            .save(LocationEvent::GimmickOccupied {
                gimmick_id: self.gimmick_id(),
                state,
            })
            .await
    }
}
