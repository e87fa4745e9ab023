//! Periodic wake-up of due Locations.

use crate::ids::LocationId;
use crate::location::{LocationUpdater, UpdateOptions};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub updated: usize,
    /// Locations whose lock was held by another cycle
    pub busy: usize,
    pub failed: usize,
}

/// Updates every Location whose pause has elapsed.
///
/// Uses the no-retry path: a Location that is busy now is picked up again on
/// a later tick.
pub struct Sweeper {
    updater: Arc<LocationUpdater>,
    interval: Duration,
    max_concurrent: usize,
}

impl Sweeper {
    pub fn new(updater: Arc<LocationUpdater>) -> Self {
        let config = &updater.config().sweeper;
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            updater,
            interval,
            max_concurrent,
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            max_concurrent = self.max_concurrent,
            "Starting location sweeper"
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.updater.operations().is_shutting_down() {
                        break;
                    }
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Location sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Location sweeper stopped");
    }

    /// Update every Location due now.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let due = self
            .updater
            .repositories()
            .locations
            .list_due(Utc::now())
            .await
            .context("failed to list due locations")?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!(due = due.len(), "Sweeping due locations");

        let outcomes: Vec<(LocationId, Result<bool>)> = stream::iter(due)
            .map(|location_id| async move {
                let outcome = self
                    .updater
                    .update_location_no_retry(None, location_id, UpdateOptions::default())
                    .await
                    .map(|snapshot| snapshot.is_some());
                (location_id, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (location_id, outcome) in outcomes {
            match outcome {
                Ok(true) => report.updated += 1,
                Ok(false) => {
                    debug!(location_id = %location_id, "Location busy, left for next sweep");
                    report.busy += 1;
                }
                Err(e) => {
                    warn!(location_id = %location_id, error = %e, "Sweep update failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
