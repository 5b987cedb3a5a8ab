//! Background collection of blobs no metadata record points at.
//!
//! Orphans appear when a saga fails or the process dies between a blob put
//! and the metadata write, and when a superseded blob could not be released.
//! Blobs younger than the grace period are never touched, which keeps the
//! sweeper away from sagas still between those two steps.

use crate::blob_store::BlobStore;
use crate::config::SweeperConfig;
use crate::error::{PictureError, PictureResult};
use crate::metadata_store::MetadataRepository;
use crate::orchestrator::{release_unreferenced, BlobGuards, Release};
use crate::resilience::{Idempotency, PolicyError, PolicySet};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    /// Skipped because they are within the grace period or their age is
    /// unknown
    pub young: usize,
    pub referenced: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct OrphanSweeper {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataRepository>,
    policies: PolicySet,
    guards: Arc<BlobGuards>,
    config: SweeperConfig,
}

impl OrphanSweeper {
    pub(crate) fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataRepository>,
        policies: PolicySet,
        guards: Arc<BlobGuards>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            blobs,
            metadata,
            policies,
            guards,
            config,
        }
    }

    /// List every blob once and delete the old unreferenced ones
    pub async fn sweep_once(&self) -> PictureResult<SweepReport> {
        let listings = self
            .policies
            .blob_store
            .execute("list", Idempotency::Idempotent, || self.blobs.list())
            .await
            .map_err(|e| match e {
                PolicyError::CircuitOpen { dependency } => PictureError::CircuitOpen { dependency },
                other => PictureError::StorageUnavailable(other),
            })?;

        let grace = self.config.grace_period();
        let now = Utc::now();
        let mut report = SweepReport::default();

        for listing in listings {
            report.scanned += 1;

            let old_enough = listing
                .last_modified
                .and_then(|modified| (now - modified).to_std().ok())
                .map(|age| age >= grace)
                .unwrap_or(false);
            if !old_enough {
                report.young += 1;
                continue;
            }

            match release_unreferenced(
                self.blobs.as_ref(),
                self.metadata.as_ref(),
                &self.policies,
                &self.guards,
                &listing.key,
                grace,
            )
            .await
            {
                Release::Deleted => report.deleted += 1,
                Release::Referenced => report.referenced += 1,
                // rewritten since it was listed
                Release::Young => report.young += 1,
                Release::Failed => report.failed += 1,
            }
        }

        metrics::counter!("picture.blobs.swept").increment(report.deleted as u64);
        info!(
            scanned = report.scanned,
            young = report.young,
            referenced = report.referenced,
            deleted = report.deleted,
            failed = report.failed,
            "Orphan sweep finished"
        );

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        if self.config.interval().is_zero() {
            error!("Orphan sweeper interval is zero, not starting");
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval_secs,
            grace_period_secs = self.config.grace_period_secs,
            "Orphan sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Orphan sweeper stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Orphan sweep failed");
                    }
                }
            }
        }
    }
}
