use super::LockBackend;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Current holder of one key.
struct Holder {
    token: String,
    /// Flipped to `true` when this holder lets go
    released_tx: watch::Sender<bool>,
    /// Forced release at TTL expiry
    expiry: JoinHandle<()>,
}

/// Single-process lock table.
///
/// Acquisition is a check-and-set on a `DashMap` entry. Each holder carries a
/// `watch` channel that waiters race against their retry delay, so a released
/// key is picked up immediately instead of on the next polling tick.
#[derive(Clone, Default)]
pub struct MemoryLockBackend {
    holders: Arc<DashMap<String, Holder>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self {
            holders: Arc::new(DashMap::new()),
        }
    }

    /// Whether any holder currently owns `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.holders.contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.holders.len()
    }

    fn remove_if_token(holders: &DashMap<String, Holder>, key: &str, token: &str) -> bool {
        match holders.remove_if(key, |_, holder| holder.token == token) {
            Some((_, holder)) => {
                holder.released_tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> anyhow::Result<bool> {
        match self.holders.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                let (released_tx, _) = watch::channel(false);

                let holders = Arc::clone(&self.holders);
                let expiry_key = key.to_string();
                let expiry_token = token.to_string();
                let expiry = tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if MemoryLockBackend::remove_if_token(&holders, &expiry_key, &expiry_token) {
                        warn!(key = %expiry_key, "Lock expired without release, forced release");
                    }
                });

                vacant.insert(Holder {
                    token: token.to_string(),
                    released_tx,
                    expiry,
                });
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) {
        if let Some((_, holder)) = self
            .holders
            .remove_if(key, |_, holder| holder.token == token)
        {
            holder.expiry.abort();
            holder.released_tx.send_replace(true);
        }
    }

    async fn wait_for_release(&self, key: &str, max_wait: Duration) {
        // Subscribe while the map entry is borrowed so a release cannot slip in between
        let mut released_rx = match self.holders.get(key) {
            Some(holder) => holder.released_tx.subscribe(),
            None => return,
        };

        tokio::select! {
            _ = released_rx.wait_for(|released| *released) => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}
