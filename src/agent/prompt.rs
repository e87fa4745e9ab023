//! Model input for an agent's turn.

use crate::error::DomainStateError;
use crate::ids::{AgentId, EntityKey};
use crate::llm::LlmMessage;
use crate::location::cycle::LocationCycle;
use crate::location::model::LocationMessage;
use std::fmt::Write;

const INSTRUCTION: &str = "Decide what you do next. Respond only with tool calls; \
use send_message to speak. Address participants by their entity key.";

pub(crate) fn build_messages(cycle: &LocationCycle, agent_id: AgentId) -> Result<Vec<LlmMessage>, DomainStateError> {
    let agent = cycle
        .agent(agent_id)
        .ok_or(DomainStateError::EntityNotFound(EntityKey::agent(agent_id)))?;
    let self_key = agent.key();

    let mut system = format!("You are {} ({}).", agent.name, self_key);
    if !agent.description.is_empty() {
        let _ = write!(system, " {}", agent.description);
    }

    let location = &cycle.location;
    let _ = write!(system, "\n\nYou are in {}.", location.name);
    if !location.description.is_empty() {
        let _ = write!(system, " {}", location.description);
    }
    if let Some(mission) = &location.mission {
        let _ = write!(system, "\nMission: {}", mission);
    }
    if let Some(canvas) = &location.canvas {
        let _ = write!(system, "\nShared canvas:\n{}", canvas);
    }

    let memories: Vec<_> = agent
        .memories
        .iter()
        .enumerate()
        .filter_map(|(slot, m)| m.as_ref().map(|m| format!("[{}] {}", slot, m)))
        .collect();
    if !memories.is_empty() {
        let _ = write!(system, "\n\nYour memories:\n{}", memories.join("\n"));
    }

    let context = cycle.context();
    let mut participants = Vec::new();
    for id in &context.agents {
        if *id == agent_id {
            continue;
        }
        if let Some(other) = cycle.agent(*id) {
            participants.push((other.key(), other.name.as_str(), other.description.as_str()));
        }
    }
    for id in &context.users {
        if let Some(user) = cycle.user(*id) {
            participants.push((EntityKey::user(user.id), user.name.as_str(), user.description.as_str()));
        }
    }
    if !participants.is_empty() {
        system.push_str("\n\nAlso here:");
        for (key, name, description) in participants {
            let _ = write!(system, "\n- {} ({})", name, key);
            if !description.is_empty() {
                let _ = write!(system, ": {}", description);
            }
            if let Some(notes) = agent.entity_memories.get(&key) {
                for note in notes {
                    let _ = write!(system, "\n  * {}", note);
                }
            }
        }
    }

    let owned: Vec<_> = cycle
        .items
        .iter()
        .filter(|i| i.owner == Some(self_key))
        .map(|i| format!("- {} (item {})", i.name, i.id))
        .collect();
    if !owned.is_empty() {
        let _ = write!(system, "\n\nYou carry:\n{}", owned.join("\n"));
    }

    let mut messages = vec![LlmMessage::system(system)];
    messages.extend(cycle.messages.iter().filter_map(|m| history_entry(m, self_key)));
    messages.push(LlmMessage::user(INSTRUCTION));
    Ok(messages)
}

/// One log entry as the agent sees it. Its own lines are assistant turns.
fn history_entry(message: &LocationMessage, self_key: EntityKey) -> Option<LlmMessage> {
    let mut text = String::new();
    if let Some(action) = &message.action {
        let _ = write!(text, "*{}* ", action);
    }
    if let Some(body) = &message.message {
        text.push_str(body);
    }
    if text.is_empty() {
        return None;
    }

    if message.entity == Some(self_key) {
        return Some(LlmMessage::assistant(text));
    }
    let speaker = match message.entity {
        Some(key) => format!("{} ({})", message.name, key),
        None => message.name.clone(),
    };
    Some(LlmMessage::user(format!("{}: {}", speaker, text.trim_end())))
}
