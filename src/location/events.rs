use super::model::{Item, LocationMessage, PauseUpdate};
use crate::gimmick::GimmickState;
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId};
use crate::parser::ToolCallDelta;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Domain events raised while a Location is updated.
///
/// Every variant except [`LocationEvent::MessageStreaming`] describes a
/// change that must be persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationEvent {
    MessageAdded {
        message: LocationMessage,
    },
    /// Partial agent message text, for live display only
    MessageStreaming {
        agent_id: AgentId,
        #[serde(skip)]
        delta: ToolCallDelta,
    },
    CanvasUpdated {
        canvas: Option<String>,
    },
    MemoryUpdated {
        agent_id: AgentId,
        slot: usize,
        memory: Option<String>,
    },
    EntityMemoryUpdated {
        agent_id: AgentId,
        entity: EntityKey,
        memories: Vec<String>,
    },
    ExpressionUpdated {
        agent_id: AgentId,
        expression: Option<String>,
    },
    ActiveUpdated {
        agent_id: AgentId,
        active: bool,
    },
    EntityCanvasUpdated {
        agent_id: AgentId,
        canvas: Option<String>,
    },
    GimmickOccupied {
        gimmick_id: GimmickId,
        state: GimmickState,
    },
    GimmickReleased {
        gimmick_id: GimmickId,
    },
    GimmickExecuting {
        gimmick_id: GimmickId,
        executor: EntityKey,
        reason: Option<String>,
    },
    GimmickExecuted {
        gimmick_id: GimmickId,
        executor: EntityKey,
    },
    GimmickExecutionFailed {
        gimmick_id: GimmickId,
        executor: EntityKey,
        error: String,
    },
    ItemAdded {
        item: Item,
    },
    ItemRemoved {
        item_id: ItemId,
    },
    ItemTransferred {
        item_id: ItemId,
        to: Option<EntityKey>,
    },
    PauseUpdated {
        pause: PauseUpdate,
    },
    ExecutionsRemainingUpdated {
        remaining: Option<i64>,
    },
    AgentExecuted {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
}

impl LocationEvent {
    /// Event name as published to subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            LocationEvent::MessageAdded { .. } => "message_added",
            LocationEvent::MessageStreaming { .. } => "message_streaming",
            LocationEvent::CanvasUpdated { .. } => "canvas_updated",
            LocationEvent::MemoryUpdated { .. } => "memory_updated",
            LocationEvent::EntityMemoryUpdated { .. } => "entity_memory_updated",
            LocationEvent::ExpressionUpdated { .. } => "expression_updated",
            LocationEvent::ActiveUpdated { .. } => "active_updated",
            LocationEvent::EntityCanvasUpdated { .. } => "entity_canvas_updated",
            LocationEvent::GimmickOccupied { .. } => "gimmick_occupied",
            LocationEvent::GimmickReleased { .. } => "gimmick_released",
            LocationEvent::GimmickExecuting { .. } => "gimmick_executing",
            LocationEvent::GimmickExecuted { .. } => "gimmick_executed",
            LocationEvent::GimmickExecutionFailed { .. } => "gimmick_execution_failed",
            LocationEvent::ItemAdded { .. } => "item_added",
            LocationEvent::ItemRemoved { .. } => "item_removed",
            LocationEvent::ItemTransferred { .. } => "item_transferred",
            LocationEvent::PauseUpdated { .. } => "pause_updated",
            LocationEvent::ExecutionsRemainingUpdated { .. } => "executions_remaining_updated",
            LocationEvent::AgentExecuted { .. } => "agent_executed",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, LocationEvent::MessageStreaming { .. })
    }
}

/// A [`LocationEvent`] as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub location_id: LocationId,
    pub event: LocationEvent,
    pub timestamp: DateTime<Utc>,
}
