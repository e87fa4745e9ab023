use super::cycle::{CycleServices, LocationCycle};
use super::effects::{EffectSink, EffectWriter, RepositoryPersister, SaveHandler, TrackedSaveHandler};
use super::events::LocationUpdate;
use super::model::{time_after, LocationSnapshot, PauseReason, PauseUpdate};
use crate::config::AgoraConfig;
use crate::ids::{AgentId, EntityKey, LocationId};
use crate::llm::LlmService;
use crate::lock::LockService;
use crate::registry::CoreRegistry;
use crate::repository::Repositories;
use crate::shutdown::ActiveOperations;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Per-call switches of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Run even though the Location is paused into the future
    pub ignore_pause_update_until: bool,
    /// Run only this agent instead of the Location's strategy
    pub resume_agent: Option<AgentId>,
}

/// Lock key guarding a Location's update cycle.
pub fn location_lock_key(id: LocationId) -> String {
    format!("location:{}", id)
}

/// Runs Location update cycles.
///
/// One cycle: lock the Location, hydrate it from the repositories, apply the
/// guards, let the resumed agent or the Location's strategy act, persist the
/// next wake-up and release the lock.
pub struct LocationUpdater {
    repos: Repositories,
    locks: Arc<dyn LockService>,
    services: Arc<CycleServices>,
    writer: EffectWriter,
    updates: broadcast::Sender<LocationUpdate>,
}

impl LocationUpdater {
    pub fn new(
        repos: Repositories,
        locks: Arc<dyn LockService>,
        llm: Arc<dyn LlmService>,
        registry: Arc<CoreRegistry>,
        config: Arc<AgoraConfig>,
        operations: Arc<ActiveOperations>,
    ) -> Self {
        let (updates, _) = broadcast::channel(1024);
        let writer = EffectWriter::new(
            Arc::new(RepositoryPersister::new(repos.clone())),
            Arc::new(TrackedSaveHandler::new(Arc::clone(&operations))),
            updates.clone(),
        );

        Self {
            repos,
            locks,
            services: Arc::new(CycleServices {
                llm,
                registry,
                config,
                operations,
            }),
            writer,
            updates,
        }
    }

    /// Route every write through `handler` instead of the default tracking
    /// handler.
    pub fn with_save_handler(mut self, handler: Arc<dyn SaveHandler>) -> Self {
        self.writer = EffectWriter::new(
            Arc::new(RepositoryPersister::new(self.repos.clone())),
            handler,
            self.updates.clone(),
        );
        self
    }

    /// Receive every event raised by any Location's cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<LocationUpdate> {
        self.updates.subscribe()
    }

    /// Events of one Location. Events missed by a lagging reader are skipped.
    pub fn location_updates(&self, location_id: LocationId) -> impl Stream<Item = LocationUpdate> + Send + 'static {
        BroadcastStream::new(self.updates.subscribe()).filter_map(move |update| {
            let update = update.ok().filter(|u| u.location_id == location_id);
            async move { update }
        })
    }

    pub fn config(&self) -> &AgoraConfig {
        &self.services.config
    }

    pub fn operations(&self) -> &Arc<ActiveOperations> {
        &self.services.operations
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// Refuse new cycles and wait up to the configured drain timeout for
    /// running cycles and gimmick executions.
    ///
    /// # Returns
    /// `true` if everything finished in time
    pub async fn shutdown(&self) -> bool {
        let timeout = self.services.config.shutdown.drain_timeout();
        self.services.operations.shutdown(timeout).await
    }

    fn lock_ttl(&self) -> Duration {
        self.services.config.lock.location_lock_ttl()
    }

    /// Update a Location, waiting for its lock.
    ///
    /// Fails with [`crate::error::LockAcquisitionError`] once the lock's
    /// retries are exhausted, and with the cycle's error after the Location
    /// has been paused with `UPDATE_ERROR`.
    pub async fn update_location(
        &self,
        actor: Option<EntityKey>,
        location_id: LocationId,
        opts: UpdateOptions,
    ) -> Result<LocationSnapshot> {
        let _operation = self.services.operations.begin()?;
        let lock = self
            .locks
            .acquire_lock(&location_lock_key(location_id), self.lock_ttl())
            .await?;

        let result = self.run_locked(actor, location_id, &opts).await;
        lock.release().await;
        result
    }

    /// Update a Location if its lock is free.
    ///
    /// # Returns
    /// `None` when another cycle holds the Location
    pub async fn update_location_no_retry(
        &self,
        actor: Option<EntityKey>,
        location_id: LocationId,
        opts: UpdateOptions,
    ) -> Result<Option<LocationSnapshot>> {
        let _operation = self.services.operations.begin()?;
        let Some(lock) = self
            .locks
            .acquire_lock_no_retry(&location_lock_key(location_id), self.lock_ttl())
            .await
        else {
            debug!(location_id = %location_id, "Location busy, skipping update");
            return Ok(None);
        };

        let result = self.run_locked(actor, location_id, &opts).await;
        lock.release().await;
        result.map(Some)
    }

    /// Read a Location and its participants into a new cycle.
    ///
    /// Does not lock; callers hold the Location's lock.
    pub(crate) async fn hydrate(&self, location_id: LocationId) -> Result<LocationCycle> {
        let repos = &self.repos;
        let location = repos
            .locations
            .get_or_create(location_id)
            .await
            .with_context(|| format!("failed to load location {}", location_id))?;

        let window = self.services.config.location.message_window;
        let (messages, agents, users, gimmicks, items) = tokio::try_join!(
            repos.locations.recent_messages(location_id, window),
            repos.agents.get_many(&location.state.agent_ids),
            repos.users.get_many(&location.state.user_ids),
            repos.gimmicks.list_by_location(location_id),
            repos.items.list_by_location(location_id),
        )
        .with_context(|| format!("failed to hydrate location {}", location_id))?;

        let sink = EffectSink::spawn(location_id, self.writer.clone());
        Ok(LocationCycle::new(
            location,
            messages,
            agents,
            users,
            gimmicks,
            items,
            Arc::clone(&self.services),
            sink,
        ))
    }

    async fn run_locked(
        &self,
        actor: Option<EntityKey>,
        location_id: LocationId,
        opts: &UpdateOptions,
    ) -> Result<LocationSnapshot> {
        let mut cycle = match self.hydrate(location_id).await {
            Ok(cycle) => cycle,
            Err(e) => {
                error!(location_id = %location_id, error = %e, "Location hydration failed");
                let pause = self.error_pause();
                if let Err(write_err) = self.repos.locations.update_pause(location_id, pause).await {
                    warn!(location_id = %location_id, error = %write_err, "Failed to record update error");
                }
                return Err(e);
            }
        };

        let result = AssertUnwindSafe(self.run_cycle(&mut cycle, actor, opts))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("update cycle of location {} panicked", location_id)));

        if let Err(e) = &result {
            error!(location_id = %location_id, error = %e, "Location update failed");
            cycle.force_pause(self.error_pause());
        }

        // Persist before the lock goes so the next cycle reads what this one wrote
        cycle.flush().await;
        result.map(|()| cycle.snapshot())
    }

    fn error_pause(&self) -> PauseUpdate {
        let until = self
            .services
            .config
            .location
            .error_retry_delay_ms
            .map(|ms| time_after(Utc::now(), Duration::from_millis(ms)));
        PauseUpdate {
            until,
            reason: PauseReason::UpdateError,
            resume_agent_id: None,
        }
    }

    async fn run_cycle(
        &self,
        cycle: &mut LocationCycle,
        actor: Option<EntityKey>,
        opts: &UpdateOptions,
    ) -> Result<()> {
        let location_id = cycle.location_id();

        if cycle.eligible_agents().is_empty() {
            info!(location_id = %location_id, "No eligible agents, pausing location");
            cycle.force_pause(PauseUpdate {
                until: None,
                reason: PauseReason::NoAgents,
                resume_agent_id: None,
            });
            return Ok(());
        }

        if !cycle.has_execution_budget() {
            info!(location_id = %location_id, "Agent execution budget spent, pausing location");
            cycle.force_pause(PauseUpdate {
                until: None,
                reason: PauseReason::NoAgentExecutions,
                resume_agent_id: None,
            });
            return Ok(());
        }

        if !opts.ignore_pause_update_until {
            if let Some(until) = cycle.location.state.pause_update_until {
                if until > cycle.now() {
                    debug!(location_id = %location_id, until = %until, "Location paused, nothing to do");
                    return Ok(());
                }
            }
        }

        let resume = opts
            .resume_agent
            .or(cycle.location.state.resume_agent_id)
            .filter(|id| cycle.is_eligible(*id));

        let delay = match resume {
            Some(agent_id) => {
                info!(location_id = %location_id, agent_id = %agent_id, actor = ?actor, "Resuming agent");
                cycle.run_agent(agent_id).await?;
                Some(cycle.config().location.agent_update_interval())
            }
            None => {
                let name = if cycle.location.core.is_empty() {
                    cycle.config().location.default_core.clone()
                } else {
                    cycle.location.core.clone()
                };
                let core = cycle.registry().location_core(&name)?;
                debug!(location_id = %location_id, core = %name, actor = ?actor, "Running location strategy");
                core.update(cycle).await?
            }
        };

        let pause = match delay.filter(|d| !d.is_zero()) {
            Some(delay) => PauseUpdate {
                until: Some(time_after(Utc::now(), delay)),
                reason: PauseReason::ScheduledPause,
                resume_agent_id: None,
            },
            None => PauseUpdate {
                until: None,
                reason: PauseReason::UpdateCompleted,
                resume_agent_id: None,
            },
        };
        cycle.finish_pause(pause).await;
        Ok(())
    }
}
