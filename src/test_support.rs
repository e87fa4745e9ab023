//! Fixtures for tests: a scripted language model, a scripted agent core and
//! a seeded in-memory world.

use crate::agent::{Agent, AgentCore};
use crate::config::AgoraConfig;
use crate::error::LlmError;
use crate::gimmick::{Gimmick, GimmickState};
use crate::ids::{AgentId, EntityKey, GimmickId, ItemId, LocationId, UserId};
use crate::llm::{ChunkStream, LlmMessage, LlmOptions, LlmResponse, LlmService, ToolCall, ToolDefinition};
use crate::location::cycle::LocationCycle;
use crate::location::model::{Item, Location, LocationMessage, User};
use crate::location::LocationUpdater;
use crate::lock::{MemoryLockService, RetryPolicy};
use crate::parser::{ParserEvent, ToolCallParser};
use crate::registry::CoreRegistry;
use crate::repository::{InMemoryStore, Repositories};
use crate::shutdown::ActiveOperations;
use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Language model that replays queued responses in order.
///
/// Every call consumes one entry. A call with nothing queued fails with
/// [`LlmError::InvalidContent`].
#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Result<Vec<String>, LlmError>>>,
    requests: Mutex<Vec<Vec<LlmMessage>>>,
    offered_tools: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a streamed response split into `chunks`.
    pub fn push_chunks<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        locked(&self.turns).push_back(Ok(chunks.into_iter().map(Into::into).collect()));
    }

    /// Queue a response holding `calls` as the `toolCalls` array.
    pub fn push_tool_calls(&self, calls: Value) {
        self.push_chunks([json!({ "toolCalls": calls }).to_string()]);
    }

    pub fn push_text(&self, text: &str) {
        self.push_chunks([text]);
    }

    pub fn push_error(&self, error: LlmError) {
        locked(&self.turns).push_back(Err(error));
    }

    /// Message lists of every call so far.
    pub fn requests(&self) -> Vec<Vec<LlmMessage>> {
        locked(&self.requests).clone()
    }

    /// Tool names offered on every tool call so far.
    pub fn offered_tools(&self) -> Vec<Vec<String>> {
        locked(&self.offered_tools).clone()
    }

    fn next_turn(&self, messages: &[LlmMessage], tools: &[ToolDefinition]) -> Result<Vec<String>, LlmError> {
        locked(&self.requests).push(messages.to_vec());
        if !tools.is_empty() {
            locked(&self.offered_tools).push(tools.iter().map(|t| t.name.clone()).collect());
        }
        locked(&self.turns).pop_front().unwrap_or_else(|| {
            Err(LlmError::InvalidContent {
                reason: "no scripted response left".to_string(),
                usage: None,
            })
        })
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn generate(&self, messages: &[LlmMessage], _options: &LlmOptions) -> Result<LlmResponse, LlmError> {
        let chunks = self.next_turn(messages, &[])?;
        Ok(LlmResponse {
            content: chunks.concat(),
            usage: None,
        })
    }

    async fn use_tools(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        _options: &LlmOptions,
    ) -> Result<Vec<ToolCall>, LlmError> {
        let chunks = self.next_turn(messages, tools)?;
        let mut parser = ToolCallParser::new(&[]).map_err(|e| LlmError::InvalidContent {
            reason: e.to_string(),
            usage: None,
        })?;
        let mut events = parser.feed(&chunks.concat());
        events.extend(parser.finalize());
        Ok(events
            .into_iter()
            .filter_map(|event| match event {
                ParserEvent::Completed(parsed) => Some(parsed.call),
                ParserEvent::Delta(_) => None,
            })
            .collect())
    }

    async fn stream_tools(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolDefinition],
        _options: &LlmOptions,
    ) -> Result<ChunkStream, LlmError> {
        use futures::stream::{self, StreamExt};

        let chunks = self.next_turn(messages, tools)?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Agent core with switchable behavior, registered as `"scripted"`.
///
/// Each run posts one message from the agent.
pub struct ScriptedAgentCore {
    wants_to_act: AtomicBool,
    fail: AtomicBool,
    panic: AtomicBool,
    hold: Mutex<Duration>,
    runs: Mutex<Vec<AgentId>>,
}

impl Default for ScriptedAgentCore {
    fn default() -> Self {
        Self {
            wants_to_act: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            hold: Mutex::new(Duration::ZERO),
            runs: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAgentCore {
    pub const NAME: &'static str = "scripted";

    pub fn set_wants_to_act(&self, wants: bool) {
        self.wants_to_act.store(wants, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_panic(&self, panic: bool) {
        self.panic.store(panic, Ordering::SeqCst);
    }

    /// Time each run spends inside the cycle before acting
    pub fn set_hold(&self, hold: Duration) {
        *locked(&self.hold) = hold;
    }

    /// Agents in the order they ran.
    pub fn runs(&self) -> Vec<AgentId> {
        locked(&self.runs).clone()
    }
}

#[async_trait]
impl AgentCore for ScriptedAgentCore {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn evaluate_action_condition(&self, cycle: &LocationCycle, agent_id: AgentId) -> bool {
        self.wants_to_act.load(Ordering::SeqCst) && cycle.is_eligible(agent_id)
    }

    async fn execute_next_actions(&self, cycle: &mut LocationCycle, agent_id: AgentId) -> anyhow::Result<usize> {
        let run = {
            let mut runs = locked(&self.runs);
            runs.push(agent_id);
            runs.len()
        };

        let hold = *locked(&self.hold);
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        if self.panic.load(Ordering::SeqCst) {
            panic!("scripted agent panicked");
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("scripted agent failed");
        }

        let name = cycle.agent(agent_id).map(|a| a.name.clone()).unwrap_or_default();
        let message = LocationMessage::new(
            cycle.location_id(),
            Some(EntityKey::agent(agent_id)),
            &name,
            cycle.now(),
        )
        .with_message(format!("turn {}", run));
        cycle.add_message(message);
        Ok(1)
    }
}

/// Seeded in-memory world plus the collaborators an updater needs.
pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<ScriptedLlm>,
    pub agent_core: Arc<ScriptedAgentCore>,
    pub operations: Arc<ActiveOperations>,
    pub config: AgoraConfig,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    /// Deterministic context ranking and fast lock retries.
    pub fn new() -> Self {
        let mut config = AgoraConfig::default();
        config.location.random_tie_break = false;
        config.lock.retry_count = 3;
        config.lock.retry_delay_ms = 10;
        config.lock.retry_jitter_ms = 0;

        Self {
            store: Arc::new(InMemoryStore::default()),
            llm: Arc::new(ScriptedLlm::new()),
            agent_core: Arc::new(ScriptedAgentCore::default()),
            operations: Arc::new(ActiveOperations::new()),
            config,
        }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut AgoraConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn repositories(&self) -> Repositories {
        Repositories::in_memory(Arc::clone(&self.store))
    }

    /// Built-in cores plus the scripted agent core.
    pub fn registry(&self) -> CoreRegistry {
        let mut registry = CoreRegistry::with_defaults();
        registry.register_agent_core(self.agent_core.clone());
        registry
    }

    pub fn updater(&self) -> LocationUpdater {
        self.updater_with(self.registry())
    }

    pub fn updater_with(&self, registry: CoreRegistry) -> LocationUpdater {
        self.updater_from(self.repositories(), registry)
    }

    /// Updater over custom repositories, e.g. wrappers that inject failures.
    pub fn updater_from(&self, repos: Repositories, registry: CoreRegistry) -> LocationUpdater {
        LocationUpdater::new(
            repos,
            Arc::new(MemoryLockService::in_memory(RetryPolicy::from(&self.config.lock))),
            self.llm.clone(),
            Arc::new(registry),
            Arc::new(self.config.clone()),
            Arc::clone(&self.operations),
        )
    }

    /// Hydrate a cycle without locking.
    pub async fn cycle(&self, updater: &LocationUpdater, id: LocationId) -> LocationCycle {
        match updater.hydrate(id).await {
            Ok(cycle) => cycle,
            Err(e) => panic!("failed to hydrate location {}: {}", id, e),
        }
    }

    /// Location using strategy `core`, with one scripted agent per id.
    pub fn seed_location(&self, id: i64, core: &str, agents: &[i64]) -> LocationId {
        let location_id = LocationId(id);
        self.store.insert_location(Location::new(location_id, core));
        for agent in agents {
            self.seed_agent(location_id, *agent, ScriptedAgentCore::NAME);
        }
        location_id
    }

    fn update_location(&self, id: LocationId, f: impl FnOnce(&mut Location)) {
        let mut location = self
            .store
            .location(id)
            .unwrap_or_else(|| Location::new(id, &self.config.location.default_core));
        f(&mut location);
        self.store.insert_location(location);
    }

    pub fn seed_agent(&self, location_id: LocationId, id: i64, core: &str) -> AgentId {
        let agent_id = AgentId(id);
        self.store.insert_agent(Agent::new(
            agent_id,
            &format!("Agent {}", id),
            core,
            self.config.agent.memory_slots,
        ));
        self.update_location(location_id, |l| l.state.agent_ids.push(agent_id));
        agent_id
    }

    pub fn seed_user(&self, location_id: LocationId, id: i64, name: &str) -> UserId {
        let user_id = UserId(id);
        self.store.insert_user(User {
            id: user_id,
            name: name.to_string(),
            description: String::new(),
        });
        self.update_location(location_id, |l| l.state.user_ids.push(user_id));
        user_id
    }

    pub fn seed_gimmick(&self, location_id: LocationId, id: i64, core: &str) -> GimmickId {
        let gimmick_id = GimmickId(id);
        self.store.insert_gimmick(Gimmick {
            id: gimmick_id,
            location_id,
            name: format!("Gimmick {}", id),
            description: String::new(),
            core: core.to_string(),
            state: GimmickState::default(),
        });
        gimmick_id
    }

    pub fn seed_item(&self, location_id: LocationId, id: i64, owner: Option<EntityKey>) -> ItemId {
        let item_id = ItemId(id);
        self.store.insert_item(Item {
            id: item_id,
            location_id,
            name: format!("Item {}", id),
            description: String::new(),
            owner,
        });
        item_id
    }

    /// Post a message as if `entity` had said it.
    pub fn seed_message(&self, location_id: LocationId, entity: EntityKey, name: &str, text: &str) {
        let message = LocationMessage::new(location_id, Some(entity), name, chrono::Utc::now()).with_message(text);
        self.store.push_message(location_id, message);
    }

    /// Change persisted Location state directly.
    pub fn edit_location(&self, id: LocationId, f: impl FnOnce(&mut Location)) {
        self.update_location(id, f);
    }
}
