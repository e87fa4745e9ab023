mod env;

use serde::Deserialize;
use std::time::Duration;

/// Complete Agora configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgoraConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub gimmick: GimmickConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Which lock service implementation backs the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// Single-process lock table (tests, standalone mode)
    Memory,
    /// JetStream key-value bucket shared by the cluster
    Nats,
}

/// Lock service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_backend")]
    pub backend: LockBackendKind,
    /// TTL of the per-Location update lock
    #[serde(default = "default_location_lock_ttl_ms")]
    pub location_lock_ttl_ms: u64,
    /// Extra attempts made by the blocking variants
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound of the random delay added to each retry wait
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_lock_backend() -> LockBackendKind {
    LockBackendKind::Memory
}

fn default_location_lock_ttl_ms() -> u64 {
    30_000
}

fn default_retry_count() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_retry_jitter_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_lock_backend(),
            location_lock_ttl_ms: default_location_lock_ttl_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

impl LockConfig {
    pub fn location_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.location_lock_ttl_ms)
    }
}

/// NATS configuration for the cluster lock backend
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    /// Key-value bucket holding lock leases
    #[serde(default = "default_nats_bucket")]
    pub bucket: String,
    #[serde(default = "default_nats_replicas")]
    pub replicas: usize,
    /// Bucket entry max age; bounds how long an abandoned lease survives
    #[serde(default = "default_nats_max_age_ms")]
    pub max_age_ms: u64,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_bucket() -> String {
    "AGORA_LOCKS".to_string()
}

fn default_nats_replicas() -> usize {
    1
}

fn default_nats_max_age_ms() -> u64 {
    30_000
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            bucket: default_nats_bucket(),
            replicas: default_nats_replicas(),
            max_age_ms: default_nats_max_age_ms(),
        }
    }
}

/// Location update configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// Number of recent messages hydrated each cycle
    #[serde(default = "default_message_window")]
    pub message_window: usize,
    #[serde(default = "default_context_limit")]
    pub max_agents_in_context: usize,
    #[serde(default = "default_context_limit")]
    pub max_users_in_context: usize,
    #[serde(default = "default_context_limit")]
    pub max_gimmicks_in_context: usize,
    /// Break recency ties randomly (true) or by id (false)
    #[serde(default = "default_random_tie_break")]
    pub random_tie_break: bool,
    /// Location core used when a Location has none configured
    #[serde(default = "default_location_core")]
    pub default_core: String,
    /// Wake delay returned by strategies after an agent acted
    #[serde(default = "default_agent_update_interval_ms")]
    pub agent_update_interval_ms: u64,
    #[serde(default = "default_until_idle_max_rounds")]
    pub until_idle_max_rounds: u32,
    /// Wake delay after a failed cycle; none pauses until an external trigger
    #[serde(default)]
    pub error_retry_delay_ms: Option<u64>,
}

fn default_message_window() -> usize {
    30
}

fn default_context_limit() -> usize {
    8
}

fn default_random_tie_break() -> bool {
    true
}

fn default_location_core() -> String {
    "round_robin".to_string()
}

fn default_agent_update_interval_ms() -> u64 {
    5_000
}

fn default_until_idle_max_rounds() -> u32 {
    8
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            message_window: default_message_window(),
            max_agents_in_context: default_context_limit(),
            max_users_in_context: default_context_limit(),
            max_gimmicks_in_context: default_context_limit(),
            random_tie_break: default_random_tie_break(),
            default_core: default_location_core(),
            agent_update_interval_ms: default_agent_update_interval_ms(),
            until_idle_max_rounds: default_until_idle_max_rounds(),
            error_retry_delay_ms: None,
        }
    }
}

impl LocationConfig {
    pub fn agent_update_interval(&self) -> Duration {
        Duration::from_millis(self.agent_update_interval_ms)
    }
}

/// Gimmick occupation and execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GimmickConfig {
    #[serde(default = "default_occupation_ms")]
    pub default_occupation_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Delay before the executing agent is resumed
    #[serde(default = "default_reschedule_delay_ms")]
    pub reschedule_delay_ms: u64,
    /// Consecutive lease renewal failures that abort an execution (0 = never)
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,
}

fn default_occupation_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_execution_timeout_ms() -> u64 {
    120_000
}

fn default_reschedule_delay_ms() -> u64 {
    1_000
}

fn default_heartbeat_failure_threshold() -> u32 {
    3
}

impl Default for GimmickConfig {
    fn default() -> Self {
        Self {
            default_occupation_ms: default_occupation_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            reschedule_delay_ms: default_reschedule_delay_ms(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
        }
    }
}

impl GimmickConfig {
    pub fn default_occupation(&self) -> Duration {
        Duration::from_millis(self.default_occupation_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Fixed number of memory slots per agent
    #[serde(default = "default_memory_slots")]
    pub memory_slots: usize,
    #[serde(default = "default_max_actions_per_turn")]
    pub max_actions_per_turn: usize,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_memory_slots() -> usize {
    8
}

fn default_max_actions_per_turn() -> usize {
    4
}

fn default_model() -> String {
    "default".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            memory_slots: default_memory_slots(),
            max_actions_per_turn: default_max_actions_per_turn(),
            model: default_model(),
            temperature: None,
        }
    }
}

/// Background sweep configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrent() -> usize {
    16
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sweep_interval_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Graceful shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AgoraConfig, Box<dyn std::error::Error + Send + Sync>> {
    let contents = std::fs::read_to_string(path)?;
    let config: AgoraConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgoraConfig::default();
        assert_eq!(config.lock.backend, LockBackendKind::Memory);
        assert_eq!(config.lock.retry_count, 10);
        assert_eq!(config.nats.bucket, "AGORA_LOCKS");
        assert_eq!(config.location.default_core, "round_robin");
        assert_eq!(config.location.error_retry_delay_ms, None);
        assert_eq!(config.gimmick.heartbeat_failure_threshold, 3);
        assert_eq!(config.agent.memory_slots, 8);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [lock]
            backend = "nats"
            retry_count = 3
            retry_delay_ms = 50

            [nats]
            url = "nats://example.com:4222"
            replicas = 3

            [location]
            message_window = 10
            random_tie_break = false
            default_core = "repeat_all"
            error_retry_delay_ms = 15000

            [gimmick]
            execution_timeout_ms = 5000
            heartbeat_failure_threshold = 0
        "#;

        let config: AgoraConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.lock.backend, LockBackendKind::Nats);
        assert_eq!(config.lock.retry_count, 3);
        assert_eq!(config.nats.url, "nats://example.com:4222");
        assert_eq!(config.nats.replicas, 3);
        assert_eq!(config.location.message_window, 10);
        assert!(!config.location.random_tie_break);
        assert_eq!(config.location.error_retry_delay_ms, Some(15_000));
        assert_eq!(config.gimmick.execution_timeout(), Duration::from_secs(5));
        assert_eq!(config.gimmick.heartbeat_failure_threshold, 0);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and fields use defaults
        let toml = r#"
            [sweeper]
            interval_ms = 250
        "#;

        let config: AgoraConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sweeper.interval_ms, 250);
        assert_eq!(config.sweeper.max_concurrent, 16);
        assert_eq!(config.lock.location_lock_ttl(), Duration::from_secs(30));
        assert_eq!(config.shutdown.drain_timeout_ms, 30_000);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\nmax_actions_per_turn = 2\nmodel = \"small\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.agent.max_actions_per_turn, 2);
        assert_eq!(config.agent.model, "small");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/agora.toml").is_err());
    }
}
