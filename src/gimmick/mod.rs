//! Gimmicks: shared capabilities a Location's participants take turns using.
//!
//! A gimmick is held by at most one occupier at a time. Occupation is a
//! lease stored on the gimmick itself: once `occupation_until` has passed the
//! gimmick reads as free again, whether or not anyone released it.

pub mod cores;
mod execution;


pub use execution::{execute, ExecuteRequest};

use crate::ids::{EntityKey, GimmickId, LocationId};
use crate::llm::{LlmOptions, LlmService, ToolDefinition};
use crate::location::model::time_after;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Persisted occupation fields of a gimmick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GimmickState {
    pub occupier: Option<EntityKey>,
    pub occupation_until: Option<DateTime<Utc>>,
    pub occupation_reason: Option<String>,
}

/// Occupation as seen at a given instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupation {
    Free,
    Occupied {
        occupier: EntityKey,
        until: DateTime<Utc>,
        reason: Option<String>,
    },
}

impl Occupation {
    pub fn is_free(&self) -> bool {
        matches!(self, Occupation::Free)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gimmick {
    pub id: GimmickId,
    pub location_id: LocationId,
    pub name: String,
    pub description: String,
    /// Name of the core that implements the gimmick's effect
    pub core: String,
    pub state: GimmickState,
}

impl Gimmick {
    pub fn key(&self) -> EntityKey {
        EntityKey::gimmick(self.id)
    }

    /// Current occupation, treating an expired lease as free.
    pub fn occupation(&self, now: DateTime<Utc>) -> Occupation {
        match (&self.state.occupier, self.state.occupation_until) {
            (Some(occupier), Some(until)) if until >= now => Occupation::Occupied {
                occupier: *occupier,
                until,
                reason: self.state.occupation_reason.clone(),
            },
            _ => Occupation::Free,
        }
    }

    /// Take the lease for `duration`.
    ///
    /// Fails, leaving the state untouched, while someone else's lease is
    /// still running.
    pub fn occupy(
        &mut self,
        occupier: EntityKey,
        duration: Duration,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.occupation(now).is_free() {
            return false;
        }
        self.renew(occupier, duration, reason, now);
        true
    }

    /// Set the lease regardless of the current occupation.
    pub(crate) fn renew(
        &mut self,
        occupier: EntityKey,
        duration: Duration,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.state = GimmickState {
            occupier: Some(occupier),
            occupation_until: Some(time_after(now, duration)),
            occupation_reason: reason,
        };
    }

    pub fn release(&mut self) {
        self.state = GimmickState::default();
    }
}

/// Occupation of a Location's gimmicks, shared by its cycle and the
/// executions the cycle started.
#[derive(Debug, Clone, Default)]
pub struct GimmickLeases(Arc<DashMap<GimmickId, GimmickState>>);

impl GimmickLeases {
    pub fn new(gimmicks: &[Gimmick]) -> Self {
        let leases = Self::default();
        for gimmick in gimmicks {
            leases.0.insert(gimmick.id, gimmick.state.clone());
        }
        leases
    }

    pub fn get(&self, id: GimmickId) -> GimmickState {
        self.0.get(&id).map(|state| state.value().clone()).unwrap_or_default()
    }

    pub fn set(&self, id: GimmickId, state: GimmickState) {
        self.0.insert(id, state);
    }

    pub fn release(&self, id: GimmickId) {
        self.set(id, GimmickState::default());
    }
}

/// Everything an executing core may use.
#[derive(Clone)]
pub struct GimmickContext {
    pub location_id: LocationId,
    pub gimmick: Gimmick,
    pub executor: EntityKey,
    pub reason: Option<String>,
    pub llm: Arc<dyn LlmService>,
    pub llm_options: LlmOptions,
}

/// Result of a successful execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GimmickOutcome {
    /// Posted to the Location as the gimmick's message
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl GimmickOutcome {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            data: None,
        }
    }
}

/// Effect behind a gimmick, selected by the gimmick's `core` name.
#[async_trait]
pub trait GimmickCore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameters the core accepts, shown to agents.
    fn describe(&self) -> ToolDefinition;

    async fn execute(&self, ctx: &GimmickContext, params: Value) -> anyhow::Result<GimmickOutcome>;
}
