//! Reconciliation sweep for lost leases.
//!
//! A caller that disappears mid-task leaves its item `locked` with a lease
//! that eventually expires. Each sweep finds `locked` items without a live
//! lease and returns them to `pending`. This is the only code path that
//! performs `locked -> pending`.
//!
//! Every reset is a separate guarded update, so a sweep that fails halfway
//! keeps the resets it made and the next sweep picks up the rest.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::TaskError;
use crate::lease::LeaseStore;
use crate::repository::ItemRepository;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `locked` items examined.
    pub scanned: usize,
    /// Items moved back to `pending`.
    pub reset: usize,
    /// Items whose lease check or reset failed. They are retried next sweep.
    pub failed: usize,
}

/// Run one pass over the `locked` items.
///
/// Only listing the locked items can fail the whole pass. Per-item failures
/// are logged and counted.
pub async fn sweep_once(
    items: &dyn ItemRepository,
    leases: &LeaseStore,
) -> Result<SweepReport, TaskError> {
    let locked = items.locked_ids().await?;
    let mut report = SweepReport {
        scanned: locked.len(),
        ..SweepReport::default()
    };

    for item_id in locked {
        match leases.exists(item_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to check lease for item {}: {}", item_id, e);
                report.failed += 1;
                continue;
            }
        }

        match items.reset_to_pending(item_id).await {
            Ok(true) => {
                info!("Lease for item {} expired, returned it to pending", item_id);
                report.reset += 1;
            }
            // Completed between the listing and the reset.
            Ok(false) => debug!("Item {} is no longer locked, leaving it", item_id),
            Err(e) => {
                warn!("Failed to reset item {}: {}", item_id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Periodic sweeper for one server instance.
///
/// Instances sharing a lease store take turns through the sweeper lease, so
/// at most one of them sweeps at a time.
pub struct Sweeper {
    items: Arc<dyn ItemRepository>,
    leases: LeaseStore,
    interval: Duration,
    instance_id: String,
}

impl Sweeper {
    pub fn new(items: Arc<dyn ItemRepository>, leases: LeaseStore, interval: Duration) -> Self {
        Self {
            items,
            leases,
            interval,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Sweep once if no other instance is sweeping.
    ///
    /// Returns `None` when the sweeper lease is held elsewhere.
    pub async fn run_once(&self) -> Result<Option<SweepReport>, TaskError> {
        if !self
            .leases
            .try_acquire_sweep(&self.instance_id, self.interval)
            .await?
        {
            debug!("Another instance holds the sweeper lease, skipping sweep");
            return Ok(None);
        }

        let result = sweep_once(self.items.as_ref(), &self.leases).await;

        match self.leases.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {} expired lease entries", purged),
            Err(e) => warn!("Failed to purge expired leases: {}", e),
        }
        if let Err(e) = self.leases.release_sweep(&self.instance_id).await {
            warn!("Failed to release sweeper lease: {}", e);
        }

        result.map(Some)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    ///
    /// A slow sweep delays the next tick rather than stacking runs.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting reconciliation sweeper every {:?} (instance {})",
            self.interval, self.instance_id
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciliation sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(Some(report)) if report.reset > 0 || report.failed > 0 => info!(
                    "Sweep finished: scanned {}, reset {}, failed {}",
                    report.scanned, report.reset, report.failed
                ),
                Ok(Some(report)) => debug!("Sweep finished: scanned {}", report.scanned),
                Ok(None) => {}
                Err(e) => error!("Sweep failed, retrying next tick: {}", e),
            }
        }
    }
}
