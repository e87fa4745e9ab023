//! In-flight work tracking for graceful shutdown.

use crate::error::DomainStateError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Counts operations in flight and refuses new ones once shutdown starts.
pub struct ActiveOperations {
    count: Arc<watch::Sender<usize>>,
    shutting_down: AtomicBool,
}

/// Keeps its operation counted until dropped.
#[must_use = "the operation ends when the guard is dropped"]
pub struct OperationGuard<'a> {
    count: &'a watch::Sender<usize>,
}

/// Owned form of [`OperationGuard`] for spawned tasks.
#[must_use = "the operation ends when the guard is dropped"]
pub struct OwnedOperationGuard {
    count: Arc<watch::Sender<usize>>,
}

impl ActiveOperations {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Start a new unit of work, unless shutdown has begun.
    pub fn begin(&self) -> Result<OperationGuard<'_>, DomainStateError> {
        self.count.send_modify(|c| *c += 1);
        let guard = OperationGuard { count: &self.count };
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DomainStateError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Count work that belongs to an operation already admitted.
    ///
    /// Never refused, so saves and continuations of running cycles still
    /// finish during shutdown.
    pub fn track(&self) -> OwnedOperationGuard {
        self.count.send_modify(|c| *c += 1);
        OwnedOperationGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn active(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new work and wait for in-flight work to drain.
    ///
    /// # Returns
    /// `true` if everything finished within `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(active = self.active(), "Shutting down, draining active operations");

        let mut rx = self.count.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|c| *c == 0))
            .await
            .is_ok();

        if drained {
            info!("All active operations drained");
        } else {
            warn!(active = self.active(), "Shutdown drain timed out");
        }
        drained
    }
}

impl Default for ActiveOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}

impl Drop for OwnedOperationGuard {
    fn drop(&mut self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}
