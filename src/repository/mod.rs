//! Persistence seams.
//!
//! The orchestrator reads and writes only through these traits; any storage
//! technology can stand behind them. [`InMemoryStore`] implements all of
//! them for tests and standalone mode.

mod memory;

pub use memory::InMemoryStore;

use crate::agent::Agent;
use crate::gimmick::{Gimmick, GimmickState};
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId, UserId};
use crate::location::model::{Item, Location, LocationMessage, PauseUpdate, User};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait LocationRepository: Send + Sync {
    /// Load a Location, creating it with default state if missing
    async fn get_or_create(&self, id: LocationId) -> Result<Location>;

    /// The newest `limit` messages, oldest first
    async fn recent_messages(&self, id: LocationId, limit: usize) -> Result<Vec<LocationMessage>>;

    async fn append_message(&self, id: LocationId, message: LocationMessage) -> Result<()>;

    async fn update_pause(&self, id: LocationId, pause: PauseUpdate) -> Result<()>;

    async fn update_remaining_executions(&self, id: LocationId, remaining: Option<i64>) -> Result<()>;

    async fn update_canvas(&self, id: LocationId, canvas: Option<String>) -> Result<()>;

    /// Locations whose pause has a deadline at or before `now`
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<LocationId>>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Agents with the given ids; unknown ids are skipped
    async fn get_many(&self, ids: &[AgentId]) -> Result<Vec<Agent>>;

    async fn update_memory(&self, id: AgentId, slot: usize, memory: Option<String>) -> Result<()>;

    async fn update_entity_memory(&self, id: AgentId, entity: EntityKey, memories: Vec<String>) -> Result<()>;

    async fn update_expression(&self, id: AgentId, expression: Option<String>) -> Result<()>;

    async fn update_active(&self, id: AgentId, active: bool) -> Result<()>;

    async fn update_canvas(&self, id: AgentId, canvas: Option<String>) -> Result<()>;

    async fn mark_executed(&self, id: AgentId, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_many(&self, ids: &[UserId]) -> Result<Vec<User>>;
}

#[async_trait]
pub trait GimmickRepository: Send + Sync {
    async fn list_by_location(&self, location_id: LocationId) -> Result<Vec<Gimmick>>;

    async fn update_occupation(&self, id: GimmickId, state: GimmickState) -> Result<()>;
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn list_by_location(&self, location_id: LocationId) -> Result<Vec<Item>>;

    async fn add(&self, item: Item) -> Result<()>;

    async fn remove(&self, id: ItemId) -> Result<()>;

    async fn transfer(&self, id: ItemId, owner: Option<EntityKey>) -> Result<()>;
}

/// Handles to every repository the orchestrator uses.
#[derive(Clone)]
pub struct Repositories {
    pub locations: Arc<dyn LocationRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub users: Arc<dyn UserRepository>,
    pub gimmicks: Arc<dyn GimmickRepository>,
    pub items: Arc<dyn ItemRepository>,
}

impl Repositories {
    /// All repositories backed by one in-memory store
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            locations: store.clone(),
            agents: store.clone(),
            users: store.clone(),
            gimmicks: store.clone(),
            items: store,
        }
    }
}
