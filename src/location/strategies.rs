//! Location update strategies, selected by the Location's `core` name.

use super::cycle::LocationCycle;
use crate::ids::AgentId;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Decides which agents act during one cycle.
#[async_trait]
pub trait LocationCore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive the cycle's agents.
    ///
    /// # Returns
    /// Delay until the next cycle; `None` pauses until an external trigger
    async fn update(&self, cycle: &mut LocationCycle) -> Result<Option<Duration>>;
}

/// Runs every eligible agent whose condition holds, once each.
///
/// # Returns
/// Number of agents that acted
async fn run_round(cycle: &mut LocationCycle) -> Result<usize> {
    let mut acted = 0;
    for agent_id in cycle.eligible_agents() {
        if !cycle.has_execution_budget() {
            debug!(location_id = %cycle.location_id(), "Execution budget spent mid-round");
            break;
        }
        // An earlier agent may have deactivated this one
        if !cycle.is_eligible(agent_id) {
            continue;
        }
        if cycle.evaluate_agent(agent_id).await? {
            cycle.run_agent(agent_id).await?;
            acted += 1;
        }
    }
    Ok(acted)
}

fn wake_delay(cycle: &LocationCycle, acted: bool) -> Option<Duration> {
    acted.then(|| cycle.config().location.agent_update_interval())
}

/// One agent per cycle: whoever has waited longest.
pub struct RoundRobinCore;

impl RoundRobinCore {
    /// Eligible agents, least recently executed first. Agents that never
    /// acted come first, in the Location's order.
    fn queue(cycle: &LocationCycle) -> Vec<AgentId> {
        let mut queue: Vec<(usize, AgentId)> = cycle.eligible_agents().into_iter().enumerate().collect();
        queue.sort_by_key(|(position, id)| {
            let last = cycle.agent(*id).and_then(|a| a.last_executed_at);
            (last, *position)
        });
        queue.into_iter().map(|(_, id)| id).collect()
    }
}

#[async_trait]
impl LocationCore for RoundRobinCore {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn update(&self, cycle: &mut LocationCycle) -> Result<Option<Duration>> {
        for agent_id in Self::queue(cycle) {
            if cycle.evaluate_agent(agent_id).await? {
                cycle.run_agent(agent_id).await?;
                return Ok(wake_delay(cycle, true));
            }
        }
        Ok(None)
    }
}

pub struct RepeatAllCore;

#[async_trait]
impl LocationCore for RepeatAllCore {
    fn name(&self) -> &'static str {
        "repeat_all"
    }

    async fn update(&self, cycle: &mut LocationCycle) -> Result<Option<Duration>> {
        let acted = run_round(cycle).await?;
        Ok(wake_delay(cycle, acted > 0))
    }
}

/// Repeats rounds until the conversation settles.
pub struct UpdateUntilIdleCore;

#[async_trait]
impl LocationCore for UpdateUntilIdleCore {
    fn name(&self) -> &'static str {
        "update_until_idle"
    }

    async fn update(&self, cycle: &mut LocationCycle) -> Result<Option<Duration>> {
        let max_rounds = cycle.config().location.until_idle_max_rounds.max(1);
        let mut any_acted = false;

        for round in 0..max_rounds {
            let acted = run_round(cycle).await?;
            debug!(location_id = %cycle.location_id(), round, acted, "Idle round finished");
            if acted == 0 {
                break;
            }
            any_acted = true;
            if !cycle.has_execution_budget() {
                break;
            }
        }

        Ok(wake_delay(cycle, any_acted))
    }
}
