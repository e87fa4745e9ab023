use super::LockBackend;
use crate::config::NatsConfig;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lease this process currently holds in the bucket.
struct HeldLease {
    token: String,
    revision: Arc<AtomicU64>,
    extender: JoinHandle<()>,
}

/// Cluster-wide lock store on a JetStream key-value bucket.
///
/// The bucket is replicated by the JetStream Raft group, so a lease is only
/// granted once a majority of servers accepted the `create`. Held leases are
/// extended in the background with revision-checked updates; the bucket's
/// `max_age` reclaims leases whose holder died without releasing.
pub struct NatsLockBackend {
    store: kv::Store,
    held: DashMap<String, HeldLease>,
}

impl NatsLockBackend {
    /// Connect to NATS and open (or create) the lock bucket
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;
        let jetstream = jetstream::new(client);

        let store = Self::ensure_bucket(&jetstream, config).await?;

        Ok(Self {
            store,
            held: DashMap::new(),
        })
    }

    /// Ensure the key-value bucket exists with the configured limits
    async fn ensure_bucket(jetstream: &jetstream::Context, config: &NatsConfig) -> Result<kv::Store> {
        if let Ok(store) = jetstream.get_key_value(&config.bucket).await {
            info!("Lock bucket '{}' already exists", config.bucket);
            return Ok(store);
        }

        info!("Lock bucket '{}' does not exist, creating...", config.bucket);
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: config.bucket.clone(),
                history: 1,
                max_age: Duration::from_millis(config.max_age_ms),
                num_replicas: config.replicas,
                ..Default::default()
            })
            .await
            .context("Failed to create lock bucket")?;

        info!("Created lock bucket '{}'", config.bucket);
        Ok(store)
    }

    fn spawn_extender(
        &self,
        key: String,
        token: String,
        ttl: Duration,
        revision: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = (ttl / 3).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;

            loop {
                timer.tick().await;
                let current = revision.load(Ordering::SeqCst);
                match store.update(&key, token.clone().into(), current).await {
                    Ok(next) => revision.store(next, Ordering::SeqCst),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to extend lock lease, lease lost");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LockBackend for NatsLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let nats_key = nats_key(key);

        match self.store.create(&nats_key, token.to_string().into()).await {
            Ok(revision) => {
                let revision = Arc::new(AtomicU64::new(revision));
                let extender =
                    self.spawn_extender(nats_key, token.to_string(), ttl, Arc::clone(&revision));
                self.held.insert(
                    key.to_string(),
                    HeldLease {
                        token: token.to_string(),
                        revision,
                        extender,
                    },
                );
                Ok(true)
            }
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => Ok(false),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to create lease for '{}'", key))),
        }
    }

    async fn release(&self, key: &str, token: &str) {
        let Some((_, lease)) = self.held.remove_if(key, |_, lease| lease.token == token) else {
            return;
        };
        lease.extender.abort();

        let revision = lease.revision.load(Ordering::SeqCst);
        if let Err(e) = self
            .store
            .delete_expect_revision(nats_key(key), Some(revision))
            .await
        {
            // Lease already expired or was taken over; nothing left to release
            debug!(key = %key, error = %e, "Lease delete rejected");
        }
    }

    async fn wait_for_release(&self, key: &str, max_wait: Duration) {
        let watch = match self.store.watch(nats_key(key)).await {
            Ok(watch) => watch,
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to watch lease, sleeping instead");
                tokio::time::sleep(max_wait).await;
                return;
            }
        };

        tokio::pin!(watch);
        let released = async {
            while let Some(entry) = watch.next().await {
                match entry {
                    Ok(entry)
                        if matches!(entry.operation, kv::Operation::Delete | kv::Operation::Purge) =>
                    {
                        return
                    }
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        };

        tokio::select! {
            _ = released => {}
            _ = tokio::time::sleep(max_wait) => {}
        }
    }
}

/// Escape a resource key into the NATS key alphabet.
///
/// Alphanumerics, `-`, `_` and `/` pass through; every other byte becomes
/// `=XX` so distinct keys stay distinct (`location:1` -> `location=3A1`).
pub fn nats_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'/') {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "={:02X}", byte);
        }
    }
    escaped
}
