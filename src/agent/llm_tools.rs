//! Agent core driven by streamed LLM tool calls.

use super::actions::{action_tools, apply_action, SEND_MESSAGE};
use super::prompt::build_messages;
use super::AgentCore;
use crate::ids::AgentId;
use crate::location::cycle::LocationCycle;
use crate::parser::{parse_tool_call_stream, ParserEvent, ToolCallParser, TrackedArgument};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Asks the model for tool calls and applies them as they complete.
///
/// Text of `send_message` calls is broadcast while it streams in.
pub struct LlmToolsCore;

#[async_trait]
impl AgentCore for LlmToolsCore {
    fn name(&self) -> &'static str {
        "llm_tools"
    }

    /// Acts when someone else has spoken since the agent's last turn, or if
    /// it has never acted.
    async fn evaluate_action_condition(&self, cycle: &LocationCycle, agent_id: AgentId) -> bool {
        let Some(agent) = cycle.agent(agent_id) else {
            return false;
        };
        if !agent.active {
            return false;
        }
        match agent.last_executed_at {
            None => true,
            Some(last) => cycle
                .messages
                .iter()
                .any(|m| m.created_at > last && m.entity != Some(agent.key())),
        }
    }

    async fn execute_next_actions(
        &self,
        cycle: &mut LocationCycle,
        agent_id: AgentId,
    ) -> anyhow::Result<usize> {
        let messages = build_messages(cycle, agent_id)?;
        let tools = action_tools(cycle);
        let options = cycle.llm_options();
        let llm = Arc::clone(cycle.llm());

        let chunks = llm.stream_tools(&messages, &tools, &options).await?;
        let parser = ToolCallParser::new(&[TrackedArgument::new(SEND_MESSAGE, "message")])?;
        let events = parse_tool_call_stream(chunks, parser);
        tokio::pin!(events);

        let limit = cycle.config().agent.max_actions_per_turn;
        let mut applied = 0;
        while applied < limit {
            let Some(event) = events.next().await else {
                break;
            };
            match event? {
                ParserEvent::Delta(delta) => cycle.publish_streaming(agent_id, delta),
                ParserEvent::Completed(parsed) => match apply_action(cycle, agent_id, &parsed.call).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {
                        warn!(location_id = %cycle.location_id(), agent_id = %agent_id, tool = %parsed.call.name, "Unknown tool, skipped");
                    }
                    Err(e) => {
                        warn!(location_id = %cycle.location_id(), agent_id = %agent_id, tool = %parsed.call.name, error = %e, "Action failed");
                    }
                },
            }
        }

        if applied == limit {
            debug!(location_id = %cycle.location_id(), agent_id = %agent_id, limit, "Action limit reached");
        }
        info!(location_id = %cycle.location_id(), agent_id = %agent_id, applied, "Agent turn finished");
        Ok(applied)
    }
}
