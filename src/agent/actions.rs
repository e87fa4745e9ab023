//! Tools an agent may call and how each one changes the Location.

use crate::gimmick::{self, ExecuteRequest};
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId};
use crate::llm::{ToolCall, ToolDefinition};
use crate::location::cycle::LocationCycle;
use crate::location::model::LocationMessage;
use crate::parser::ENTITY_KEY_ARGUMENT;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::debug;

pub const SEND_MESSAGE: &str = "send_message";
pub const SET_EXPRESSION: &str = "set_expression";
pub const UPDATE_MEMORY: &str = "update_memory";
pub const REMEMBER_ENTITY: &str = "remember_entity";
pub const EDIT_CANVAS: &str = "edit_canvas";
pub const UPDATE_ENTITY_CANVAS: &str = "update_entity_canvas";
pub const USE_GIMMICK: &str = "use_gimmick";
pub const GIVE_ITEM: &str = "give_item";

/// Tool definitions offered to an agent in this cycle.
pub fn action_tools(cycle: &LocationCycle) -> Vec<ToolDefinition> {
    let mut tools = vec![
        ToolDefinition {
            name: SEND_MESSAGE.to_string(),
            description: "Say something to the Location".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "What to say" },
                    "action": { "type": "string", "description": "Optional gesture or action" },
                    "entityKey": { "type": "string", "description": "Optional addressee, e.g. user:3" },
                },
                "required": ["message"],
            }),
        },
        ToolDefinition::with_string_args(
            SET_EXPRESSION,
            "Change your visible expression",
            &[("expression", "Short description of your expression")],
        ),
        ToolDefinition {
            name: UPDATE_MEMORY.to_string(),
            description: format!(
                "Overwrite one of your {} memory slots; an empty memory clears it",
                cycle.config().agent.memory_slots
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "slot": { "type": "integer", "minimum": 0 },
                    "memory": { "type": "string" },
                },
                "required": ["slot", "memory"],
            }),
        },
        ToolDefinition::with_string_args(
            REMEMBER_ENTITY,
            "Remember something about another participant",
            &[(ENTITY_KEY_ARGUMENT, "Who it is about, e.g. agent:2"), ("memory", "What to remember")],
        ),
        ToolDefinition::with_string_args(
            EDIT_CANVAS,
            "Replace the Location's shared canvas",
            &[("canvas", "New canvas content")],
        ),
        ToolDefinition::with_string_args(
            UPDATE_ENTITY_CANVAS,
            "Replace your personal canvas",
            &[("canvas", "New canvas content")],
        ),
    ];

    let gimmicks: Vec<String> = cycle
        .context()
        .gimmicks
        .iter()
        .filter_map(|id| cycle.gimmick(*id))
        .map(|g| match cycle.registry().gimmick_core(&g.core) {
            Ok(core) => format!(
                "- {} ({}): {} Parameters: {}",
                g.id,
                g.name,
                core.describe().description,
                core.describe().parameters["properties"]
            ),
            Err(_) => format!("- {} ({}): {}", g.id, g.name, g.description),
        })
        .collect();
    if !gimmicks.is_empty() {
        tools.push(ToolDefinition {
            name: USE_GIMMICK.to_string(),
            description: format!("Use a gimmick of this Location. Available:\n{}", gimmicks.join("\n")),
            parameters: json!({
                "type": "object",
                "properties": {
                    "gimmickId": { "type": "integer" },
                    "params": { "type": "object" },
                    "reason": { "type": "string" },
                },
                "required": ["gimmickId"],
            }),
        });
    }

    tools.push(ToolDefinition::with_string_args(
        GIVE_ITEM,
        "Hand one of your items to another participant",
        &[("itemId", "Item to give"), (ENTITY_KEY_ARGUMENT, "Recipient, e.g. user:1")],
    ));
    tools
}

fn required_str<'a>(call: &'a ToolCall, key: &str) -> Result<&'a str> {
    call.str_arg(key)
        .with_context(|| format!("{} requires '{}'", call.name, key))
}

fn entity_arg(call: &ToolCall) -> Result<Option<EntityKey>> {
    match call.str_arg(ENTITY_KEY_ARGUMENT).map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => Ok(Some(EntityKey::from_str(raw)?)),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Apply one tool call for `agent_id`.
///
/// # Returns
/// `false` if the tool is unknown
pub async fn apply_action(cycle: &mut LocationCycle, agent_id: AgentId, call: &ToolCall) -> Result<bool> {
    let agent = cycle
        .agent(agent_id)
        .ok_or_else(|| anyhow!("agent {} is not in location {}", agent_id, cycle.location_id()))?;
    let agent_key = agent.key();
    let agent_name = agent.name.clone();
    debug!(location_id = %cycle.location_id(), agent_id = %agent_id, tool = %call.name, "Applying action");

    match call.name.as_str() {
        SEND_MESSAGE => {
            let text = required_str(call, "message")?;
            let target = entity_arg(call)?;
            if let Some(target) = &target {
                if !cycle.is_participant(target) {
                    bail!("{} is not in this location", target);
                }
            }
            let mut message =
                LocationMessage::new(cycle.location_id(), Some(agent_key), &agent_name, cycle.now()).with_message(text);
            message.target = target;
            message.action = call.str_arg("action").and_then(non_empty);
            message.expression = cycle.agent(agent_id).and_then(|a| a.expression.clone());
            cycle.add_message(message);
        }
        SET_EXPRESSION => {
            let expression = non_empty(required_str(call, "expression")?);
            cycle.set_expression(agent_id, expression)?;
        }
        UPDATE_MEMORY => {
            let slot = call
                .i64_arg("slot")
                .and_then(|s| usize::try_from(s).ok())
                .context("update_memory requires a non-negative 'slot'")?;
            let memory = non_empty(required_str(call, "memory")?);
            cycle.update_memory(agent_id, slot, memory)?;
        }
        REMEMBER_ENTITY => {
            let entity = entity_arg(call)?.context("remember_entity requires 'entityKey'")?;
            let memory = non_empty(required_str(call, "memory")?).context("memory is empty")?;
            cycle.remember_entity(agent_id, entity, memory)?;
        }
        EDIT_CANVAS => {
            let canvas = non_empty(required_str(call, "canvas")?);
            cycle.set_location_canvas(canvas);
        }
        UPDATE_ENTITY_CANVAS => {
            let canvas = non_empty(required_str(call, "canvas")?);
            cycle.set_agent_canvas(agent_id, canvas)?;
        }
        USE_GIMMICK => {
            let gimmick_id = GimmickId(call.i64_arg("gimmickId").context("use_gimmick requires 'gimmickId'")?);
            let params = match call.arguments.get("params") {
                None | Some(Value::Null) => json!({}),
                Some(Value::String(raw)) => serde_json::from_str(raw).context("params is not valid JSON")?,
                Some(other) => other.clone(),
            };
            let mut request = ExecuteRequest::new(agent_key, params);
            if let Some(reason) = call.str_arg("reason").and_then(non_empty) {
                request = request.with_reason(reason);
            }
            // Completion is reported back through the Location
            let _ = gimmick::execute(cycle, gimmick_id, request)?;
        }
        GIVE_ITEM => {
            let item_id = ItemId(call.i64_arg("itemId").context("give_item requires 'itemId'")?);
            let to = entity_arg(call)?.context("give_item requires 'entityKey'")?;
            let owner = cycle
                .items
                .iter()
                .find(|i| i.id == item_id)
                .with_context(|| format!("item {} is not here", item_id))?
                .owner;
            if owner != Some(agent_key) {
                bail!("{} does not carry item {}", agent_key, item_id);
            }
            cycle.transfer_item(item_id, Some(to))?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}
