use super::context::rank_participants;
use super::effects::EffectSink;
use super::events::LocationEvent;
use super::model::{Item, Location, LocationMessage, LocationSnapshot, PauseUpdate, User};
use crate::agent::Agent;
use crate::config::AgoraConfig;
use crate::error::DomainStateError;
use crate::gimmick::{Gimmick, GimmickLeases};
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId, UserId};
use crate::llm::{LlmOptions, LlmService};
use crate::parser::ToolCallDelta;
use crate::registry::CoreRegistry;
use crate::shutdown::ActiveOperations;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Collaborators shared by every cycle.
pub struct CycleServices {
    pub llm: Arc<dyn LlmService>,
    pub registry: Arc<CoreRegistry>,
    pub config: Arc<AgoraConfig>,
    pub operations: Arc<ActiveOperations>,
}

/// Participants selected for model context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantContext {
    pub agents: Vec<AgentId>,
    pub users: Vec<UserId>,
    pub gimmicks: Vec<GimmickId>,
}

/// Pause written by a gimmick completion while the cycle was running.
type PauseOverride = Arc<Mutex<Option<PauseUpdate>>>;

/// Sets a Location's next wake-up from outside its cycle.
///
/// Once used, the running cycle keeps this pause instead of writing its own.
#[derive(Clone)]
pub struct Rescheduler {
    sink: EffectSink,
    pause_override: PauseOverride,
}

impl Rescheduler {
    pub async fn reschedule(&self, pause: PauseUpdate) {
        let mut slot = self.pause_override.lock().await;
        self.sink.emit(LocationEvent::PauseUpdated {
            pause: pause.clone(),
        });
        *slot = Some(pause);
    }
}

/// One update cycle of one Location.
///
/// Holds the aggregates read at the start of the cycle. Mutations apply to
/// them immediately and are queued on the cycle's [`EffectSink`].
pub struct LocationCycle {
    pub location: Location,
    pub messages: Vec<LocationMessage>,
    pub agents: Vec<Agent>,
    pub users: Vec<User>,
    /// Occupation lives in `leases`; read gimmicks through [`Self::gimmick`]
    gimmicks: Vec<Gimmick>,
    pub items: Vec<Item>,
    leases: GimmickLeases,
    context: ParticipantContext,
    services: Arc<CycleServices>,
    sink: EffectSink,
    pause_override: PauseOverride,
}

impl LocationCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        location: Location,
        messages: Vec<LocationMessage>,
        agents: Vec<Agent>,
        users: Vec<User>,
        gimmicks: Vec<Gimmick>,
        items: Vec<Item>,
        services: Arc<CycleServices>,
        sink: EffectSink,
    ) -> Self {
        let leases = GimmickLeases::new(&gimmicks);
        let mut cycle = Self {
            location,
            messages,
            agents,
            users,
            gimmicks,
            items,
            leases,
            context: ParticipantContext::default(),
            services,
            sink,
            pause_override: Arc::new(Mutex::new(None)),
        };
        cycle.context = cycle.rank_context();
        cycle
    }

    fn rank_context(&self) -> ParticipantContext {
        let cfg = &self.services.config.location;
        let rank = |keys: Vec<EntityKey>, limit: usize| {
            rank_participants(&keys, &self.messages, limit, cfg.random_tie_break)
        };

        ParticipantContext {
            agents: rank(self.agents.iter().map(Agent::key).collect(), cfg.max_agents_in_context)
                .iter()
                .filter_map(EntityKey::as_agent)
                .collect(),
            users: rank(
                self.users.iter().map(|u| EntityKey::user(u.id)).collect(),
                cfg.max_users_in_context,
            )
            .iter()
            .filter_map(EntityKey::as_user)
            .collect(),
            gimmicks: rank(self.gimmicks.iter().map(Gimmick::key).collect(), cfg.max_gimmicks_in_context)
                .iter()
                .filter_map(EntityKey::as_gimmick)
                .collect(),
        }
    }

    pub fn location_id(&self) -> LocationId {
        self.location.id
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn config(&self) -> &AgoraConfig {
        &self.services.config
    }

    pub fn llm(&self) -> &Arc<dyn LlmService> {
        &self.services.llm
    }

    pub fn registry(&self) -> &CoreRegistry {
        &self.services.registry
    }

    pub fn operations(&self) -> &Arc<ActiveOperations> {
        &self.services.operations
    }

    pub fn llm_options(&self) -> LlmOptions {
        LlmOptions {
            model: self.config().agent.model.clone(),
            temperature: self.config().agent.temperature,
            max_tokens: None,
        }
    }

    pub fn context(&self) -> &ParticipantContext {
        &self.context
    }

    pub(crate) fn sink(&self) -> &EffectSink {
        &self.sink
    }

    pub fn rescheduler(&self) -> Rescheduler {
        Rescheduler {
            sink: self.sink.clone(),
            pause_override: Arc::clone(&self.pause_override),
        }
    }

    pub fn emit(&self, event: LocationEvent) {
        self.sink.emit(event);
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn agent_mut(&mut self, id: AgentId) -> Result<&mut Agent, DomainStateError> {
        self.agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(DomainStateError::EntityNotFound(EntityKey::agent(id)))
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    /// A gimmick with its current occupation, including changes made by
    /// executions running in the background.
    pub fn gimmick(&self, id: GimmickId) -> Option<Gimmick> {
        self.gimmicks.iter().find(|g| g.id == id).map(|g| Gimmick {
            state: self.leases.get(id),
            ..g.clone()
        })
    }

    fn require_gimmick(&self, id: GimmickId) -> Result<Gimmick, DomainStateError> {
        self.gimmick(id)
            .ok_or(DomainStateError::EntityNotFound(EntityKey::gimmick(id)))
    }

    pub(crate) fn gimmick_leases(&self) -> &GimmickLeases {
        &self.leases
    }

    /// Display name of any participant
    pub fn entity_name(&self, key: &EntityKey) -> Option<&str> {
        if let Some(id) = key.as_agent() {
            return self.agent(id).map(|a| a.name.as_str());
        }
        if let Some(id) = key.as_user() {
            return self.user(id).map(|u| u.name.as_str());
        }
        key.as_gimmick()
            .and_then(|id| self.gimmicks.iter().find(|g| g.id == id))
            .map(|g| g.name.as_str())
    }

    pub fn is_participant(&self, key: &EntityKey) -> bool {
        self.entity_name(key).is_some()
    }

    /// Active agents, in the Location's order.
    pub fn eligible_agents(&self) -> Vec<AgentId> {
        self.location
            .state
            .agent_ids
            .iter()
            .copied()
            .filter(|id| self.agent(*id).is_some_and(|a| a.active))
            .collect()
    }

    pub fn is_eligible(&self, id: AgentId) -> bool {
        self.agent(id).is_some_and(|a| a.active)
    }

    pub fn add_message(&mut self, message: LocationMessage) {
        self.messages.push(message.clone());
        let window = self.config().location.message_window;
        if self.messages.len() > window {
            let excess = self.messages.len() - window;
            self.messages.drain(..excess);
        }
        self.emit(LocationEvent::MessageAdded { message });
    }

    pub fn set_location_canvas(&mut self, canvas: Option<String>) {
        self.location.canvas = canvas.clone();
        self.emit(LocationEvent::CanvasUpdated { canvas });
    }

    pub fn update_memory(&mut self, agent_id: AgentId, slot: usize, memory: Option<String>) -> Result<()> {
        let agent = self.agent_mut(agent_id)?;
        let current = agent
            .memories
            .get_mut(slot)
            .ok_or_else(|| anyhow!("agent {} has no memory slot {}", agent_id, slot))?;
        *current = memory.clone();
        self.emit(LocationEvent::MemoryUpdated {
            agent_id,
            slot,
            memory,
        });
        Ok(())
    }

    /// Add a memory about another participant, dropping the oldest beyond
    /// the agent's slot count.
    pub fn remember_entity(&mut self, agent_id: AgentId, entity: EntityKey, memory: String) -> Result<()> {
        if !self.is_participant(&entity) {
            return Err(DomainStateError::EntityNotFound(entity).into());
        }
        let limit = self.config().agent.memory_slots.max(1);
        let agent = self.agent_mut(agent_id)?;
        let memories = agent.entity_memories.entry(entity).or_default();
        memories.push(memory);
        if memories.len() > limit {
            let excess = memories.len() - limit;
            memories.drain(..excess);
        }
        let memories = memories.clone();
        self.emit(LocationEvent::EntityMemoryUpdated {
            agent_id,
            entity,
            memories,
        });
        Ok(())
    }

    pub fn set_expression(&mut self, agent_id: AgentId, expression: Option<String>) -> Result<()> {
        self.agent_mut(agent_id)?.expression = expression.clone();
        self.emit(LocationEvent::ExpressionUpdated {
            agent_id,
            expression,
        });
        Ok(())
    }

    pub fn set_agent_active(&mut self, agent_id: AgentId, active: bool) -> Result<()> {
        self.agent_mut(agent_id)?.active = active;
        self.emit(LocationEvent::ActiveUpdated { agent_id, active });
        Ok(())
    }

    pub fn set_agent_canvas(&mut self, agent_id: AgentId, canvas: Option<String>) -> Result<()> {
        self.agent_mut(agent_id)?.canvas = canvas.clone();
        self.emit(LocationEvent::EntityCanvasUpdated { agent_id, canvas });
        Ok(())
    }

    pub fn add_item(&mut self, item: Item) {
        self.items.push(item.clone());
        self.emit(LocationEvent::ItemAdded { item });
    }

    pub fn remove_item(&mut self, item_id: ItemId) -> Result<Item> {
        let index = self
            .items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| anyhow!("item {} not found in location {}", item_id, self.location.id))?;
        let item = self.items.remove(index);
        self.emit(LocationEvent::ItemRemoved { item_id });
        Ok(item)
    }

    pub fn transfer_item(&mut self, item_id: ItemId, to: Option<EntityKey>) -> Result<()> {
        if let Some(target) = &to {
            if !self.is_participant(target) {
                return Err(DomainStateError::EntityNotFound(*target).into());
            }
        }
        let location_id = self.location.id;
        let item = self
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| anyhow!("item {} not found in location {}", item_id, location_id))?;
        item.owner = to;
        self.emit(LocationEvent::ItemTransferred { item_id, to });
        Ok(())
    }

    /// Occupy a gimmick; `false` while someone else holds it.
    pub fn occupy_gimmick(
        &mut self,
        gimmick_id: GimmickId,
        occupier: EntityKey,
        duration: Option<Duration>,
        reason: Option<String>,
    ) -> Result<bool> {
        let now = self.now();
        let duration = duration.unwrap_or_else(|| self.config().gimmick.default_occupation());
        let mut gimmick = self.require_gimmick(gimmick_id)?;
        if !gimmick.occupy(occupier, duration, reason, now) {
            return Ok(false);
        }
        self.leases.set(gimmick_id, gimmick.state.clone());
        self.emit(LocationEvent::GimmickOccupied {
            gimmick_id,
            state: gimmick.state,
        });
        Ok(true)
    }

    /// Take or extend a gimmick's lease without checking the occupation.
    pub(crate) fn renew_gimmick(
        &mut self,
        gimmick_id: GimmickId,
        occupier: EntityKey,
        reason: Option<String>,
    ) -> Result<()> {
        let now = self.now();
        let duration = self.config().gimmick.default_occupation();
        let mut gimmick = self.require_gimmick(gimmick_id)?;
        gimmick.renew(occupier, duration, reason, now);
        self.leases.set(gimmick_id, gimmick.state.clone());
        self.emit(LocationEvent::GimmickOccupied {
            gimmick_id,
            state: gimmick.state,
        });
        Ok(())
    }

    pub fn release_gimmick(&mut self, gimmick_id: GimmickId) -> Result<()> {
        self.require_gimmick(gimmick_id)?;
        self.leases.release(gimmick_id);
        self.emit(LocationEvent::GimmickReleased { gimmick_id });
        Ok(())
    }

    /// Broadcast partial message text; never persisted.
    pub fn publish_streaming(&self, agent_id: AgentId, delta: ToolCallDelta) {
        self.emit(LocationEvent::MessageStreaming { agent_id, delta });
    }

    pub fn has_execution_budget(&self) -> bool {
        self.location
            .state
            .remaining_agent_executions
            .map_or(true, |n| n > 0)
    }

    fn consume_execution(&mut self) {
        if let Some(remaining) = self.location.state.remaining_agent_executions {
            let remaining = Some(remaining - 1);
            self.location.state.remaining_agent_executions = remaining;
            self.emit(LocationEvent::ExecutionsRemainingUpdated { remaining });
        }
    }

    /// Ask an agent's core whether it wants to act.
    pub async fn evaluate_agent(&self, agent_id: AgentId) -> Result<bool> {
        let agent = self
            .agent(agent_id)
            .ok_or(DomainStateError::EntityNotFound(EntityKey::agent(agent_id)))?;
        let core = self.registry().agent_core(&agent.core)?;
        Ok(core.evaluate_action_condition(self, agent_id).await)
    }

    /// Run one action cycle of an agent and charge it to the budget.
    pub async fn run_agent(&mut self, agent_id: AgentId) -> Result<usize> {
        let agent = self
            .agent(agent_id)
            .ok_or(DomainStateError::EntityNotFound(EntityKey::agent(agent_id)))?;
        let core = self.registry().agent_core(&agent.core)?;

        let actions = core.execute_next_actions(self, agent_id).await?;
        debug!(location_id = %self.location.id, agent_id = %agent_id, actions, "Agent acted");

        let at = self.now();
        self.agent_mut(agent_id)?.last_executed_at = Some(at);
        self.emit(LocationEvent::AgentExecuted { agent_id, at });
        self.consume_execution();
        Ok(actions)
    }

    /// Write the cycle's closing pause unless a reschedule already did.
    pub(crate) async fn finish_pause(&mut self, pause: PauseUpdate) {
        let slot = self.pause_override.lock().await;
        match slot.as_ref() {
            Some(rescheduled) => self.location.state.apply_pause(rescheduled),
            None => {
                self.location.state.apply_pause(&pause);
                self.sink.emit(LocationEvent::PauseUpdated { pause });
            }
        }
    }

    /// Write a pause regardless of reschedules.
    pub(crate) fn force_pause(&mut self, pause: PauseUpdate) {
        self.location.state.apply_pause(&pause);
        self.emit(LocationEvent::PauseUpdated { pause });
    }

    pub async fn flush(&self) {
        self.sink.flush().await;
    }

    pub fn snapshot(&self) -> LocationSnapshot {
        LocationSnapshot {
            location: self.location.clone(),
            messages: self.messages.clone(),
            agent_ids: self.location.state.agent_ids.clone(),
            user_ids: self.location.state.user_ids.clone(),
            gimmick_ids: self.gimmicks.iter().map(|g| g.id).collect(),
        }
    }
}
