//! Typed identifiers for Location participants.
//!
//! Every kind of id wraps an `i64` but is its own type, so an `AgentId` can
//! never be passed where a `GimmickId` is expected. `EntityKey` is the
//! `"<kind>:<id>"` identity used across subsystems.

use crate::error::DomainStateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! typed_id {
    ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        $vis struct $name(pub i64);

        impl $name {
            #[inline]
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                $name(id)
            }
        }
    };
}

typed_id! {
    /// Shared interaction space.
    pub struct LocationId;
}

typed_id! {
    /// Autonomous participant driven by an agent core.
    pub struct AgentId;
}

typed_id! {
    /// Human participant.
    pub struct UserId;
}

typed_id! {
    /// Invokable shared capability.
    pub struct GimmickId;
}

typed_id! {
    pub struct ItemId;
}

/// Kind of Location participant.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Agent,
    User,
    Gimmick,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Agent => "agent",
            EntityType::User => "user",
            EntityType::Gimmick => "gimmick",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(EntityType::Agent),
            "user" => Ok(EntityType::User),
            "gimmick" => Ok(EntityType::Gimmick),
            other => Err(DomainStateError::UnknownEntityKey(other.to_string())),
        }
    }
}

/// Canonical `"<kind>:<id>"` identity of an Agent, User or Gimmick.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    pub kind: EntityType,
    pub id: i64,
}

impl EntityKey {
    pub fn agent(id: AgentId) -> Self {
        Self {
            kind: EntityType::Agent,
            id: id.0,
        }
    }

    pub fn user(id: UserId) -> Self {
        Self {
            kind: EntityType::User,
            id: id.0,
        }
    }

    pub fn gimmick(id: GimmickId) -> Self {
        Self {
            kind: EntityType::Gimmick,
            id: id.0,
        }
    }

    /// Returns the agent id if this key addresses an agent.
    pub fn as_agent(&self) -> Option<AgentId> {
        (self.kind == EntityType::Agent).then_some(AgentId(self.id))
    }

    pub fn as_user(&self) -> Option<UserId> {
        (self.kind == EntityType::User).then_some(UserId(self.id))
    }

    pub fn as_gimmick(&self) -> Option<GimmickId> {
        (self.kind == EntityType::Gimmick).then_some(GimmickId(self.id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = DomainStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| DomainStateError::UnknownEntityKey(s.to_string()))?;
        let kind = kind
            .parse::<EntityType>()
            .map_err(|_| DomainStateError::UnknownEntityKey(s.to_string()))?;
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| DomainStateError::UnknownEntityKey(s.to_string()))?;
        Ok(Self { kind, id })
    }
}

impl TryFrom<String> for EntityKey {
    type Error = DomainStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> String {
        key.to_string()
    }
}
