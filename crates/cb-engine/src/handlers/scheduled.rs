//! Recurring maintenance jobs: fan out per-entity syncs for an office and
//! prune stale reference data.

use cb_common::{job_names, CleanupPayload, EntityType, SyncAllPayload, SyncJobPayload};
use cb_queue::{Job, QueuedJob};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{EngineError, JobContext, JobHandler};

/// Expand one `sync-all` job into per-entity sync jobs for the office,
/// skipping any (office, entity) slot that already has a sync running.
pub struct SyncAllHandler {
    ctx: Arc<JobContext>,
}

impl SyncAllHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncAllHandler {
    fn name(&self) -> &'static str {
        job_names::SYNC_ALL
    }

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError> {
        let payload: SyncAllPayload = job
            .payload()
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        let office_id = payload.office_id;

        let mut enqueued = 0u32;
        for entity_type in EntityType::ALL {
            let in_progress = self
                .ctx
                .sync_status
                .get(office_id, entity_type)
                .await?
                .is_some_and(|s| s.is_in_progress());
            if in_progress {
                debug!(
                    office_id = %office_id,
                    entity_type = %entity_type,
                    "Sync in progress, not enqueuing another"
                );
                continue;
            }

            let kind = if payload.full { "full" } else { "inc" };
            let sync = SyncJobPayload {
                office_id,
                entity_type,
                cursor: None,
                full: payload.full,
            };
            let job = Job::new(
                job_names::SYNC_ENTITY,
                office_id,
                format!("sync-{kind}-{office_id}-{entity_type}"),
                &sync,
            )?;
            self.ctx.publisher.publish(job).await?;
            enqueued += 1;
        }

        info!(
            office_id = %office_id,
            full = payload.full,
            enqueued = enqueued,
            "Fanned out sync jobs"
        );
        Ok(())
    }
}

/// Delete reference rows the legacy system has stopped reporting.
pub struct CleanupHandler {
    ctx: Arc<JobContext>,
}

impl CleanupHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl JobHandler for CleanupHandler {
    fn name(&self) -> &'static str {
        job_names::CLEANUP_REFERENCE_DATA
    }

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError> {
        let payload: CleanupPayload = job
            .payload()
            .map_err(|e| EngineError::Payload(e.to_string()))?;

        let cutoff = Utc::now() - Duration::days(payload.stale_after_days);
        let mut pruned = 0u64;
        for entity_type in EntityType::ALL.into_iter().filter(|e| e.is_reference()) {
            pruned += self
                .ctx
                .reference
                .delete_stale(payload.office_id, entity_type, cutoff)
                .await?;
        }

        info!(
            office_id = %payload.office_id,
            stale_after_days = payload.stale_after_days,
            pruned = pruned,
            "Reference data cleanup finished"
        );
        Ok(())
    }
}
