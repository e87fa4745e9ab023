use super::{AgoraConfig, LockBackendKind};

impl AgoraConfig {
    /// Override selected fields from env vars, keeping current values when unset or invalid.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("AGORA_LOCK_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "memory" => self.lock.backend = LockBackendKind::Memory,
                "nats" => self.lock.backend = LockBackendKind::Nats,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("AGORA_LOCK_RETRY_COUNT") {
            if let Ok(n) = v.parse::<u32>() {
                self.lock.retry_count = n;
            }
        }
        if let Ok(v) = std::env::var("AGORA_LOCK_RETRY_DELAY_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.lock.retry_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("NATS_URL") {
            if !v.is_empty() {
                self.nats.url = v;
            }
        }

        self
    }
}
