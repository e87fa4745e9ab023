//! Error taxonomy shared by the lock service, the LLM seam and the domain.
//!
//! Boundaries return `anyhow::Result`; callers that care about the kind of
//! failure recover these types with `downcast_ref`.

use crate::ids::{EntityKey, GimmickId, LocationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Blocking lock acquisition ran out of retries.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to acquire lock on {keys:?} after {attempts} attempts")]
pub struct LockAcquisitionError {
    pub keys: Vec<String>,
    pub attempts: u32,
    /// Last backend failure, if contention was not the only cause
    pub last_error: Option<String>,
}

/// Token accounting reported by a provider, kept even when the call fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// Upstream provider rejected the request.
    #[error("LLM API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Empty, blocked or unparsable model output.
    #[error("LLM returned invalid content: {reason}")]
    InvalidContent {
        reason: String,
        usage: Option<LlmUsage>,
    },
}

impl LlmError {
    /// Usage telemetry carried by the error, for billing on failed calls.
    pub fn usage(&self) -> Option<&LlmUsage> {
        match self {
            LlmError::InvalidContent { usage, .. } => usage.as_ref(),
            LlmError::Api { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainStateError {
    #[error("unknown entity key '{0}'")]
    UnknownEntityKey(String),

    #[error("entity {0} is not part of this location")]
    EntityNotFound(EntityKey),

    #[error("location {0} not found")]
    LocationNotFound(LocationId),

    #[error("gimmick {gimmick} is occupied by {occupier}")]
    GimmickOccupied {
        gimmick: GimmickId,
        occupier: EntityKey,
    },

    #[error("unknown {kind} core '{name}'")]
    UnknownCore { kind: &'static str, name: String },

    #[error("shutdown in progress, rejecting new work")]
    ShuttingDown,
}
