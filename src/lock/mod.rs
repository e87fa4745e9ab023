//! Exclusive, TTL-bounded leases on string resource keys.
//!
//! `LockManager` owns the algorithm shared by every backend: keys are put in
//! canonical (sorted, deduplicated) order, acquired one by one, and rolled back
//! on the first conflict. Because every caller walks keys in the same order a
//! circular wait cannot form. Backends only provide single-key primitives.

mod memory;
mod nats;

pub use memory::MemoryLockBackend;
pub use nats::{nats_key, NatsLockBackend};

use crate::config::{AgoraConfig, LockBackendKind, LockConfig};
use crate::error::LockAcquisitionError;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;


/// Lock service contract consumed by the orchestrator.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire all `keys`, retrying on contention. Fails with
    /// [`LockAcquisitionError`] once retries are exhausted.
    async fn multi_lock(&self, keys: &[String], ttl: Duration) -> Result<Lock, LockAcquisitionError>;

    /// Single attempt. `None` means some key is held elsewhere (or the backend
    /// is unreachable); it is not an error.
    async fn multi_lock_no_retry(&self, keys: &[String], ttl: Duration) -> Option<Lock>;

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Lock, LockAcquisitionError> {
        self.multi_lock(&[key.to_string()], ttl).await
    }

    async fn acquire_lock_no_retry(&self, key: &str, ttl: Duration) -> Option<Lock> {
        self.multi_lock_no_retry(&[key.to_string()], ttl).await
    }
}

/// Single-key primitives a lock store must provide.
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Check-and-set `key` to `token`. `Ok(false)` means another holder owns it.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Release `key` if it is still held under `token`.
    async fn release(&self, key: &str, token: &str);

    /// Resolve when the current holder of `key` releases it, or after `max_wait`.
    async fn wait_for_release(&self, key: &str, max_wait: Duration);
}

/// Bounded retry schedule for the blocking variants.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts made after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
}

impl RetryPolicy {
    fn next_wait(&self) -> Duration {
        if self.retry_jitter.is_zero() {
            return self.retry_delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.retry_jitter.as_millis() as u64);
        self.retry_delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for RetryPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

/// Handle over one or more held keys.
///
/// Lives only for the critical section. `release()` may be called any number
/// of times; only the first call reaches the backend. Dropping an unreleased
/// lock, e.g. when its holder's future is cancelled, releases it on a spawned
/// task; outside a runtime it is left to expire at its TTL.
pub struct Lock {
    keys: Vec<String>,
    token: String,
    backend: Arc<dyn LockBackend>,
    released: AtomicBool,
}

impl Lock {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for key in self.keys.iter().rev() {
            self.backend.release(key, &self.token).await;
        }
        debug!(keys = ?self.keys, "Lock released");
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(keys = ?self.keys, "Lock dropped outside a runtime, leaving it to expire");
            return;
        };

        let keys = std::mem::take(&mut self.keys);
        let token = std::mem::take(&mut self.token);
        let backend = Arc::clone(&self.backend);
        runtime.spawn(async move {
            for key in keys.iter().rev() {
                backend.release(key, &token).await;
            }
            debug!(keys = ?keys, "Dropped lock released");
        });
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("keys", &self.keys)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Outcome of one all-or-nothing pass over the canonical key list.
enum Attempt {
    Acquired,
    /// Held elsewhere; carries the key that blocked us
    Contended(String),
    Failed(anyhow::Error),
}

/// Lock service over any [`LockBackend`].
pub struct LockManager<B: LockBackend> {
    backend: Arc<B>,
    retry: RetryPolicy,
}

impl<B: LockBackend> LockManager<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        Self {
            backend: Arc::new(backend),
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn attempt(&self, keys: &[String], token: &str, ttl: Duration) -> Attempt {
        let mut acquired: Vec<&String> = Vec::with_capacity(keys.len());

        for key in keys {
            let outcome = self.backend.try_acquire(key, token, ttl).await;
            match outcome {
                Ok(true) => acquired.push(key),
                Ok(false) => {
                    self.rollback(&acquired, token).await;
                    return Attempt::Contended(key.clone());
                }
                Err(e) => {
                    self.rollback(&acquired, token).await;
                    return Attempt::Failed(e);
                }
            }
        }

        Attempt::Acquired
    }

    async fn rollback(&self, acquired: &[&String], token: &str) {
        for key in acquired.iter().rev() {
            self.backend.release(key, token).await;
        }
    }

    fn make_lock(&self, keys: Vec<String>, token: String) -> Lock {
        Lock {
            keys,
            token,
            backend: self.backend.clone() as Arc<dyn LockBackend>,
            released: AtomicBool::new(false),
        }
    }
}

/// Sorted, deduplicated key order shared by every caller.
pub fn canonical_keys(keys: &[String]) -> Vec<String> {
    let mut keys = keys.to_vec();
    keys.sort();
    keys.dedup();
    keys
}

#[async_trait]
impl<B: LockBackend> LockService for LockManager<B> {
    async fn multi_lock(&self, keys: &[String], ttl: Duration) -> Result<Lock, LockAcquisitionError> {
        let keys = canonical_keys(keys);
        let token = Uuid::new_v4().to_string();
        let max_attempts = self.retry.retry_count + 1;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(&keys, &token, ttl).await {
                Attempt::Acquired => return Ok(self.make_lock(keys, token)),
                Attempt::Contended(blocking_key) => {
                    debug!(key = %blocking_key, attempt = attempt, "Lock contended");
                    if attempt < max_attempts {
                        self.backend
                            .wait_for_release(&blocking_key, self.retry.next_wait())
                            .await;
                    }
                }
                Attempt::Failed(e) => {
                    warn!(keys = ?keys, attempt = attempt, error = %e, "Lock backend error");
                    last_error = Some(e.to_string());
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.next_wait()).await;
                    }
                }
            }
        }

        Err(LockAcquisitionError {
            keys,
            attempts: max_attempts,
            last_error,
        })
    }

    async fn multi_lock_no_retry(&self, keys: &[String], ttl: Duration) -> Option<Lock> {
        let keys = canonical_keys(keys);
        let token = Uuid::new_v4().to_string();

        match self.attempt(&keys, &token, ttl).await {
            Attempt::Acquired => Some(self.make_lock(keys, token)),
            Attempt::Contended(blocking_key) => {
                debug!(key = %blocking_key, "Lock busy, not retrying");
                None
            }
            Attempt::Failed(e) => {
                warn!(keys = ?keys, error = %e, "Lock backend error, not retrying");
                None
            }
        }
    }
}

/// Build the lock service selected by `config.lock.backend`.
pub async fn from_config(config: &AgoraConfig) -> anyhow::Result<Arc<dyn LockService>> {
    let retry = RetryPolicy::from(&config.lock);
    let service: Arc<dyn LockService> = match config.lock.backend {
        LockBackendKind::Memory => Arc::new(MemoryLockService::in_memory(retry)),
        LockBackendKind::Nats => {
            let backend = NatsLockBackend::connect(&config.nats).await?;
            Arc::new(LockManager::new(backend, retry))
        }
    };
    info!(backend = ?config.lock.backend, "Lock service ready");
    Ok(service)
}

/// In-process lock service for tests and standalone mode.
pub type MemoryLockService = LockManager<MemoryLockBackend>;

impl MemoryLockService {
    pub fn in_memory(retry: RetryPolicy) -> Self {
        LockManager::new(MemoryLockBackend::new(), retry)
    }
}
