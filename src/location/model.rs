use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// `now + delay`, saturating instead of overflowing.
pub fn time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Why a Location's update loop is currently dormant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseReason {
    NoAgents,
    NoAgentExecutions,
    ScheduledPause,
    UpdateCompleted,
    UpdateError,
    GimmickExecutionFailed,
    GimmickExecuted,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::NoAgents => "NO_AGENTS",
            PauseReason::NoAgentExecutions => "NO_AGENT_EXECUTIONS",
            PauseReason::ScheduledPause => "SCHEDULED_PAUSE",
            PauseReason::UpdateCompleted => "UPDATE_COMPLETED",
            PauseReason::UpdateError => "UPDATE_ERROR",
            PauseReason::GimmickExecutionFailed => "GIMMICK_EXECUTION_FAILED",
            PauseReason::GimmickExecuted => "GIMMICK_EXECUTED",
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next wake-up of a Location, written as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseUpdate {
    /// `None` pauses until an external trigger
    pub until: Option<DateTime<Utc>>,
    pub reason: PauseReason,
    /// Agent to run first on the next cycle
    pub resume_agent_id: Option<AgentId>,
}

/// Persisted update state of a Location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationState {
    pub agent_ids: Vec<AgentId>,
    pub user_ids: Vec<UserId>,
    pub pause_update_until: Option<DateTime<Utc>>,
    pub pause_reason: PauseReason,
    /// Remaining agent action cycles; `None` is unlimited
    pub remaining_agent_executions: Option<i64>,
    pub resume_agent_id: Option<AgentId>,
}

impl Default for LocationState {
    fn default() -> Self {
        Self {
            agent_ids: Vec::new(),
            user_ids: Vec::new(),
            pause_update_until: None,
            pause_reason: PauseReason::UpdateCompleted,
            remaining_agent_executions: None,
            resume_agent_id: None,
        }
    }
}

impl LocationState {
    pub fn apply_pause(&mut self, update: &PauseUpdate) {
        self.pause_update_until = update.until;
        self.pause_reason = update.reason;
        self.resume_agent_id = update.resume_agent_id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub description: String,
    /// Name of the update strategy
    pub core: String,
    pub mission: Option<String>,
    pub canvas: Option<String>,
    pub state: LocationState,
}

impl Location {
    pub fn new(id: LocationId, core: &str) -> Self {
        Self {
            id,
            name: format!("Location {}", id),
            description: String::new(),
            core: core.to_string(),
            mission: None,
            canvas: None,
            state: LocationState::default(),
        }
    }
}

/// One entry of a Location's message log. `entity` is `None` for system
/// notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationMessage {
    pub location_id: LocationId,
    pub entity: Option<EntityKey>,
    pub target: Option<EntityKey>,
    pub name: String,
    pub message: Option<String>,
    pub action: Option<String>,
    pub expression: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocationMessage {
    pub fn new(location_id: LocationId, entity: Option<EntityKey>, name: &str, at: DateTime<Utc>) -> Self {
        Self {
            location_id,
            entity,
            target: None,
            name: name.to_string(),
            message: None,
            action: None,
            expression: None,
            image: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn system(location_id: LocationId, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut message = Self::new(location_id, None, "system", at);
        message.message = Some(text.into());
        message
    }

    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub location_id: LocationId,
    pub name: String,
    pub description: String,
    pub owner: Option<EntityKey>,
}

/// What an update call hands back: the Location as the cycle left it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSnapshot {
    pub location: Location,
    pub messages: Vec<LocationMessage>,
    pub agent_ids: Vec<AgentId>,
    pub user_ids: Vec<UserId>,
    pub gimmick_ids: Vec<GimmickId>,
}

impl LocationSnapshot {
    pub fn state(&self) -> &LocationState {
        &self.location.state
    }
}
