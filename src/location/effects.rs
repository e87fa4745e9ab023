//! Persistence of the effects an update cycle produces.
//!
//! Mutations are applied to the cycle's in-memory aggregates immediately and
//! queued here as [`LocationEvent`]s. One worker per cycle writes them in
//! order through the [`SaveHandler`], so hosts can wrap, batch or await the
//! actual writes.

use super::events::{LocationEvent, LocationUpdate};
use crate::ids::LocationId;
use crate::repository::Repositories;
use crate::shutdown::ActiveOperations;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Writes one event to storage.
#[async_trait]
pub trait EventPersister: Send + Sync {
    async fn persist(&self, location_id: LocationId, event: &LocationEvent) -> Result<()>;
}

/// Wraps every pending write.
#[async_trait]
pub trait SaveHandler: Send + Sync {
    async fn handle_save(&self, save: BoxFuture<'static, Result<()>>) -> Result<()>;
}

/// Maps events onto repository writes.
pub struct RepositoryPersister {
    repos: Repositories,
}

impl RepositoryPersister {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }
}

#[async_trait]
impl EventPersister for RepositoryPersister {
    async fn persist(&self, location_id: LocationId, event: &LocationEvent) -> Result<()> {
        let repos = &self.repos;
        match event {
            LocationEvent::MessageAdded { message } => {
                repos.locations.append_message(location_id, message.clone()).await
            }
            LocationEvent::MessageStreaming { .. } => Ok(()),
            LocationEvent::CanvasUpdated { canvas } => {
                repos.locations.update_canvas(location_id, canvas.clone()).await
            }
            LocationEvent::MemoryUpdated { agent_id, slot, memory } => {
                repos.agents.update_memory(*agent_id, *slot, memory.clone()).await
            }
            LocationEvent::EntityMemoryUpdated { agent_id, entity, memories } => {
                repos
                    .agents
                    .update_entity_memory(*agent_id, *entity, memories.clone())
                    .await
            }
            LocationEvent::ExpressionUpdated { agent_id, expression } => {
                repos.agents.update_expression(*agent_id, expression.clone()).await
            }
            LocationEvent::ActiveUpdated { agent_id, active } => {
                repos.agents.update_active(*agent_id, *active).await
            }
            LocationEvent::EntityCanvasUpdated { agent_id, canvas } => {
                repos.agents.update_canvas(*agent_id, canvas.clone()).await
            }
            LocationEvent::GimmickOccupied { gimmick_id, state } => {
                repos.gimmicks.update_occupation(*gimmick_id, state.clone()).await
            }
            LocationEvent::GimmickReleased { gimmick_id } => {
                repos.gimmicks.update_occupation(*gimmick_id, Default::default()).await
            }
            // Occupation and outcome messages travel as their own events
            LocationEvent::GimmickExecuting { .. }
            | LocationEvent::GimmickExecuted { .. }
            | LocationEvent::GimmickExecutionFailed { .. } => Ok(()),
            LocationEvent::ItemAdded { item } => repos.items.add(item.clone()).await,
            LocationEvent::ItemRemoved { item_id } => repos.items.remove(*item_id).await,
            LocationEvent::ItemTransferred { item_id, to } => {
                repos.items.transfer(*item_id, *to).await
            }
            LocationEvent::PauseUpdated { pause } => {
                repos.locations.update_pause(location_id, pause.clone()).await
            }
            LocationEvent::ExecutionsRemainingUpdated { remaining } => {
                repos
                    .locations
                    .update_remaining_executions(location_id, *remaining)
                    .await
            }
            LocationEvent::AgentExecuted { agent_id, at } => {
                repos.agents.mark_executed(*agent_id, *at).await
            }
        }
    }
}

/// Default handler: counts each write as active work so shutdown waits for
/// it.
pub struct TrackedSaveHandler {
    operations: Arc<ActiveOperations>,
}

impl TrackedSaveHandler {
    pub fn new(operations: Arc<ActiveOperations>) -> Self {
        Self { operations }
    }
}

#[async_trait]
impl SaveHandler for TrackedSaveHandler {
    async fn handle_save(&self, save: BoxFuture<'static, Result<()>>) -> Result<()> {
        let _guard = self.operations.track();
        save.await
    }
}

/// Persister and handler shared by every sink.
#[derive(Clone)]
pub struct EffectWriter {
    persister: Arc<dyn EventPersister>,
    save_handler: Arc<dyn SaveHandler>,
    updates: broadcast::Sender<LocationUpdate>,
}

impl EffectWriter {
    pub fn new(
        persister: Arc<dyn EventPersister>,
        save_handler: Arc<dyn SaveHandler>,
        updates: broadcast::Sender<LocationUpdate>,
    ) -> Self {
        Self {
            persister,
            save_handler,
            updates,
        }
    }

    fn publish(&self, location_id: LocationId, event: &LocationEvent) {
        // No subscribers is fine
        let _ = self.updates.send(LocationUpdate {
            location_id,
            event: event.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn write(&self, location_id: LocationId, event: LocationEvent) -> Result<()> {
        let persister = Arc::clone(&self.persister);
        let save = async move { persister.persist(location_id, &event).await }.boxed();
        self.save_handler.handle_save(save).await
    }
}

enum SinkMessage {
    Persist {
        event: LocationEvent,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Ordered effect queue of one Location.
///
/// Clones share the queue; the worker stops once every clone is dropped.
#[derive(Clone)]
pub struct EffectSink {
    location_id: LocationId,
    tx: mpsc::UnboundedSender<SinkMessage>,
    writer: EffectWriter,
}

impl EffectSink {
    /// Start the worker for `location_id`
    pub fn spawn(location_id: LocationId, writer: EffectWriter) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker_writer = writer.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Persist { event, ack } => {
                        let name = event.name();
                        let result = worker_writer.write(location_id, event).await;
                        if let Err(e) = &result {
                            warn!(location_id = %location_id, event = name, error = %e, "Failed to persist location event");
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                    }
                    SinkMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(location_id = %location_id, "Effect sink closed");
        });

        Self {
            location_id,
            tx,
            writer,
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    /// Publish an event and queue it for persistence.
    pub fn emit(&self, event: LocationEvent) {
        self.writer.publish(self.location_id, &event);
        if !event.is_persistent() {
            return;
        }
        if self.tx.send(SinkMessage::Persist { event, ack: None }).is_err() {
            warn!(location_id = %self.location_id, "Effect sink worker gone, event dropped");
        }
    }

    /// Publish an event and wait until it is persisted.
    pub async fn save(&self, event: LocationEvent) -> Result<()> {
        self.writer.publish(self.location_id, &event);
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SinkMessage::Persist {
                event,
                ack: Some(ack),
            })
            .map_err(|_| anyhow!("effect sink for location {} is closed", self.location_id))?;
        done.await
            .map_err(|_| anyhow!("effect sink for location {} dropped a save", self.location_id))?
    }

    /// Wait until everything queued so far is persisted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
