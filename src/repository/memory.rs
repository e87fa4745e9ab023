use super::{AgentRepository, GimmickRepository, ItemRepository, LocationRepository, UserRepository};
use crate::agent::Agent;
use crate::error::DomainStateError;
use crate::gimmick::{Gimmick, GimmickState};
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId, UserId};
use crate::location::model::{Item, Location, LocationMessage, PauseUpdate, User};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Process-local storage for every repository.
pub struct InMemoryStore {
    default_core: String,
    locations: DashMap<LocationId, Location>,
    messages: DashMap<LocationId, Vec<LocationMessage>>,
    agents: DashMap<AgentId, Agent>,
    users: DashMap<UserId, User>,
    gimmicks: DashMap<GimmickId, Gimmick>,
    items: DashMap<ItemId, Item>,
}

impl InMemoryStore {
    pub fn new(default_core: &str) -> Self {
        Self {
            default_core: default_core.to_string(),
            locations: DashMap::new(),
            messages: DashMap::new(),
            agents: DashMap::new(),
            users: DashMap::new(),
            gimmicks: DashMap::new(),
            items: DashMap::new(),
        }
    }

    pub fn insert_location(&self, location: Location) {
        self.locations.insert(location.id, location);
    }

    pub fn insert_agent(&self, agent: Agent) {
        self.agents.insert(agent.id, agent);
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn insert_gimmick(&self, gimmick: Gimmick) {
        self.gimmicks.insert(gimmick.id, gimmick);
    }

    pub fn insert_item(&self, item: Item) {
        self.items.insert(item.id, item);
    }

    pub fn push_message(&self, id: LocationId, message: LocationMessage) {
        self.messages.entry(id).or_default().push(message);
    }

    pub fn location(&self, id: LocationId) -> Option<Location> {
        self.locations.get(&id).map(|l| l.clone())
    }

    pub fn agent(&self, id: AgentId) -> Option<Agent> {
        self.agents.get(&id).map(|a| a.clone())
    }

    pub fn gimmick(&self, id: GimmickId) -> Option<Gimmick> {
        self.gimmicks.get(&id).map(|g| g.clone())
    }

    pub fn item(&self, id: ItemId) -> Option<Item> {
        self.items.get(&id).map(|i| i.clone())
    }

    /// Full message log of a Location
    pub fn messages(&self, id: LocationId) -> Vec<LocationMessage> {
        self.messages.get(&id).map(|m| m.clone()).unwrap_or_default()
    }

    fn with_location<T>(&self, id: LocationId, f: impl FnOnce(&mut Location) -> T) -> Result<T> {
        let mut location = self
            .locations
            .get_mut(&id)
            .ok_or(DomainStateError::LocationNotFound(id))?;
        Ok(f(&mut location))
    }

    fn with_agent<T>(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> T) -> Result<T> {
        let mut agent = self
            .agents
            .get_mut(&id)
            .ok_or_else(|| DomainStateError::EntityNotFound(EntityKey::agent(id)))?;
        Ok(f(&mut agent))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new("round_robin")
    }
}

#[async_trait]
impl LocationRepository for InMemoryStore {
    async fn get_or_create(&self, id: LocationId) -> Result<Location> {
        let location = self
            .locations
            .entry(id)
            .or_insert_with(|| Location::new(id, &self.default_core));
        Ok(location.clone())
    }

    async fn recent_messages(&self, id: LocationId, limit: usize) -> Result<Vec<LocationMessage>> {
        let Some(log) = self.messages.get(&id) else {
            return Ok(Vec::new());
        };
        let skip = log.len().saturating_sub(limit);
        Ok(log[skip..].to_vec())
    }

    async fn append_message(&self, id: LocationId, message: LocationMessage) -> Result<()> {
        self.messages.entry(id).or_default().push(message);
        Ok(())
    }

    async fn update_pause(&self, id: LocationId, pause: PauseUpdate) -> Result<()> {
        self.with_location(id, |l| l.state.apply_pause(&pause))
    }

    async fn update_remaining_executions(&self, id: LocationId, remaining: Option<i64>) -> Result<()> {
        self.with_location(id, |l| l.state.remaining_agent_executions = remaining)
    }

    async fn update_canvas(&self, id: LocationId, canvas: Option<String>) -> Result<()> {
        self.with_location(id, |l| l.canvas = canvas)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<LocationId>> {
        let mut due: Vec<LocationId> = self
            .locations
            .iter()
            .filter(|l| l.state.pause_update_until.is_some_and(|until| until <= now))
            .map(|l| l.id)
            .collect();
        due.sort();
        Ok(due)
    }
}

#[async_trait]
impl AgentRepository for InMemoryStore {
    async fn get_many(&self, ids: &[AgentId]) -> Result<Vec<Agent>> {
        Ok(ids.iter().filter_map(|id| self.agent(*id)).collect())
    }

    async fn update_memory(&self, id: AgentId, slot: usize, memory: Option<String>) -> Result<()> {
        self.with_agent(id, |a| match a.memories.get_mut(slot) {
            Some(current) => {
                *current = memory;
                Ok(())
            }
            None => Err(anyhow!("agent {} has no memory slot {}", id, slot)),
        })?
    }

    async fn update_entity_memory(&self, id: AgentId, entity: EntityKey, memories: Vec<String>) -> Result<()> {
        self.with_agent(id, |a| {
            a.entity_memories.insert(entity, memories);
        })
    }

    async fn update_expression(&self, id: AgentId, expression: Option<String>) -> Result<()> {
        self.with_agent(id, |a| a.expression = expression)
    }

    async fn update_active(&self, id: AgentId, active: bool) -> Result<()> {
        self.with_agent(id, |a| a.active = active)
    }

    async fn update_canvas(&self, id: AgentId, canvas: Option<String>) -> Result<()> {
        self.with_agent(id, |a| a.canvas = canvas)
    }

    async fn mark_executed(&self, id: AgentId, at: DateTime<Utc>) -> Result<()> {
        self.with_agent(id, |a| a.last_executed_at = Some(at))
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn get_many(&self, ids: &[UserId]) -> Result<Vec<User>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| u.clone()))
            .collect())
    }
}

#[async_trait]
impl GimmickRepository for InMemoryStore {
    async fn list_by_location(&self, location_id: LocationId) -> Result<Vec<Gimmick>> {
        let mut gimmicks: Vec<Gimmick> = self
            .gimmicks
            .iter()
            .filter(|g| g.location_id == location_id)
            .map(|g| g.clone())
            .collect();
        gimmicks.sort_by_key(|g| g.id);
        Ok(gimmicks)
    }

    async fn update_occupation(&self, id: GimmickId, state: GimmickState) -> Result<()> {
        let mut gimmick = self
            .gimmicks
            .get_mut(&id)
            .ok_or_else(|| DomainStateError::EntityNotFound(EntityKey::gimmick(id)))?;
        gimmick.state = state;
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for InMemoryStore {
    async fn list_by_location(&self, location_id: LocationId) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .items
            .iter()
            .filter(|i| i.location_id == location_id)
            .map(|i| i.clone())
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn add(&self, item: Item) -> Result<()> {
        self.insert_item(item);
        Ok(())
    }

    async fn remove(&self, id: ItemId) -> Result<()> {
        self.items.remove(&id);
        Ok(())
    }

    async fn transfer(&self, id: ItemId, owner: Option<EntityKey>) -> Result<()> {
        let mut item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| anyhow!("item {} not found", id))?;
        item.owner = owner;
        Ok(())
    }
}
