//! Autonomous participants of a Location.
//!
//! An [`Agent`] is persisted data; what it does on its turn is decided by the
//! [`AgentCore`] its `core` name selects.

mod actions;
pub mod llm_tools;
mod prompt;


pub use actions::{apply_action, action_tools};
pub use llm_tools::LlmToolsCore;

use crate::ids::{AgentId, EntityKey};
use crate::location::cycle::LocationCycle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub core: String,
    /// Fixed number of memory slots; `None` is an empty slot
    pub memories: Vec<Option<String>>,
    /// What this agent remembers about other participants
    pub entity_memories: HashMap<EntityKey, Vec<String>>,
    pub expression: Option<String>,
    pub active: bool,
    pub canvas: Option<String>,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: AgentId, name: &str, core: &str, memory_slots: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: String::new(),
            core: core.to_string(),
            memories: vec![None; memory_slots],
            entity_memories: HashMap::new(),
            expression: None,
            active: true,
            canvas: None,
            last_executed_at: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::agent(self.id)
    }
}

/// Behavior of an agent during a Location update cycle.
#[async_trait]
pub trait AgentCore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the agent wants to act in this cycle.
    async fn evaluate_action_condition(&self, cycle: &LocationCycle, agent_id: AgentId) -> bool;

    /// Run one action cycle for the agent.
    ///
    /// # Returns
    /// Number of actions applied
    async fn execute_next_actions(
        &self,
        cycle: &mut LocationCycle,
        agent_id: AgentId,
    ) -> anyhow::Result<usize>;
}
