//! Core registry - Maps persisted core names to implementations.
//!
//! Locations, agents and gimmicks name their behavior with a string stored
//! alongside their data. The registry is filled from an explicit list at
//! startup; hosts may add their own cores before handing it to the updater.

use crate::agent::{AgentCore, LlmToolsCore};
use crate::error::DomainStateError;
use crate::gimmick::cores::{DiceCore, OracleCore};
use crate::gimmick::GimmickCore;
use crate::location::strategies::{LocationCore, RepeatAllCore, RoundRobinCore, UpdateUntilIdleCore};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct CoreRegistry {
    agents: HashMap<&'static str, Arc<dyn AgentCore>>,
    locations: HashMap<&'static str, Arc<dyn LocationCore>>,
    gimmicks: HashMap<&'static str, Arc<dyn GimmickCore>>,
}

impl CoreRegistry {
    /// Registry holding every built-in core.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();

        registry.register_agent_core(Arc::new(LlmToolsCore));

        registry.register_location_core(Arc::new(RoundRobinCore));
        registry.register_location_core(Arc::new(RepeatAllCore));
        registry.register_location_core(Arc::new(UpdateUntilIdleCore));

        registry.register_gimmick_core(Arc::new(DiceCore));
        registry.register_gimmick_core(Arc::new(OracleCore));

        registry
    }

    /// Register an agent core under its name, replacing any previous one
    pub fn register_agent_core(&mut self, core: Arc<dyn AgentCore>) {
        self.agents.insert(core.name(), core);
    }

    pub fn register_location_core(&mut self, core: Arc<dyn LocationCore>) {
        self.locations.insert(core.name(), core);
    }

    pub fn register_gimmick_core(&mut self, core: Arc<dyn GimmickCore>) {
        self.gimmicks.insert(core.name(), core);
    }

    pub fn agent_core(&self, name: &str) -> Result<Arc<dyn AgentCore>, DomainStateError> {
        self.agents.get(name).cloned().ok_or_else(|| unknown("agent", name))
    }

    pub fn location_core(&self, name: &str) -> Result<Arc<dyn LocationCore>, DomainStateError> {
        self.locations
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("location", name))
    }

    pub fn gimmick_core(&self, name: &str) -> Result<Arc<dyn GimmickCore>, DomainStateError> {
        self.gimmicks
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("gimmick", name))
    }

    /// Names of the registered location cores, sorted
    pub fn location_core_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.locations.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn unknown(kind: &'static str, name: &str) -> DomainStateError {
    DomainStateError::UnknownCore {
        kind,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_registered() {
        let registry = CoreRegistry::with_defaults();
        assert_eq!(registry.agent_core("llm_tools").unwrap().name(), "llm_tools");
        assert_eq!(registry.gimmick_core("dice").unwrap().name(), "dice");
        assert_eq!(registry.gimmick_core("oracle").unwrap().name(), "oracle");
        assert_eq!(
            registry.location_core_names(),
            vec!["repeat_all", "round_robin", "update_until_idle"]
        );
    }

    #[test]
    fn test_unknown_core_is_domain_error() {
        let registry = CoreRegistry::with_defaults();
        let err = registry.location_core("chaos").err().unwrap();
        assert_eq!(
            err,
            DomainStateError::UnknownCore {
                kind: "location",
                name: "chaos".to_string()
            }
        );
        assert_eq!(err.to_string(), "unknown location core 'chaos'");
    }
}
