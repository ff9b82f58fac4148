//! Pull one entity type for one office from the legacy system.

use cb_common::{
    job_names, AuditLogEntry, AuditOperation, EntityType, ExternalId, OfficeId, SyncJobPayload,
    TriageJobPayload,
};
use cb_queue::{Job, QueuedJob};
use cb_store::{StoreError, SyncOutcome};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{EngineError, JobContext, JobHandler};

enum PullResult {
    Finished { synced: i64, failed: i64 },
    Cancelled,
}

pub struct SyncJobHandler {
    ctx: Arc<JobContext>,
}

impl SyncJobHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Walk every page from the cursor, upserting records one at a time.
    ///
    /// A single bad record never aborts the batch: its failure is counted,
    /// audited, and the loop moves on. Only a failed retrieval call aborts.
    /// Cancellation is re-checked between pages, not mid-page.
    async fn pull_all(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        cursor: Option<&str>,
    ) -> Result<PullResult, EngineError> {
        let mut page = 1u32;
        let mut synced = 0i64;
        let mut failed = 0i64;

        loop {
            let result = self
                .ctx
                .client
                .search(office_id, entity_type, page, cursor)
                .await?;

            for item in &result.items {
                match self.apply_record(office_id, entity_type, item).await {
                    Ok(()) => synced += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            office_id = %office_id,
                            entity_type = %entity_type,
                            error = %e,
                            "Record failed to apply, continuing batch"
                        );
                        let mut entry =
                            AuditLogEntry::new(office_id, entity_type, AuditOperation::Update)
                                .with_error(e.to_string());
                        if let Some(id) = item.get("id").and_then(|v| v.as_i64()) {
                            if let Some(external_id) = ExternalId::from_trusted(id) {
                                entry = entry.with_external_id(external_id);
                            }
                        }
                        self.ctx.audit.append(&entry).await?;
                    }
                }
            }

            if !result.has_more() {
                break;
            }
            page += 1;

            if self.ctx.sync_status.is_cancelled(office_id, entity_type).await? {
                return Ok(PullResult::Cancelled);
            }
        }

        Ok(PullResult::Finished { synced, failed })
    }

    /// Upsert one raw legacy record into the shadow store. Newly-seen
    /// inbound emails additionally get a triage job.
    async fn apply_record(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        item: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let raw_id = item
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| EngineError::Payload("legacy record missing id".to_string()))?;
        let external_id = ExternalId::from_trusted(raw_id)
            .ok_or_else(|| EngineError::Payload(format!("invalid external id: {raw_id}")))?;

        if entity_type.is_reference() {
            self.ctx
                .reference
                .upsert(office_id, entity_type, external_id, item)
                .await?;
            return Ok(());
        }

        let repo = self
            .ctx
            .shadow_repo(entity_type)
            .ok_or_else(|| EngineError::Payload(format!("no shadow table for {entity_type}")))?;

        let seen_before = repo
            .find_by_external_id(office_id, external_id)
            .await?
            .is_some();
        let internal_id = repo.upsert(office_id, external_id, item).await?;

        if entity_type == EntityType::Emails && !seen_before {
            let payload = TriageJobPayload {
                office_id,
                email_id: internal_id,
                external_email_id: external_id,
            };
            let job = Job::new(
                job_names::TRIAGE_PROCESS_EMAIL,
                office_id,
                format!("triage-{office_id}-{external_id}"),
                &payload,
            )?;
            self.ctx.publisher.publish(job).await?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncJobHandler {
    fn name(&self) -> &'static str {
        job_names::SYNC_ENTITY
    }

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError> {
        let payload: SyncJobPayload = job
            .payload()
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        let office_id = payload.office_id;
        let entity_type = payload.entity_type;

        // Full sync ignores any cursor; incremental falls back to the one
        // recorded by the previous run
        let cursor = if payload.full {
            None
        } else {
            match payload.cursor {
                Some(c) => Some(c),
                None => self
                    .ctx
                    .sync_status
                    .get(office_id, entity_type)
                    .await?
                    .and_then(|s| s.cursor),
            }
        };

        match self.ctx.sync_status.begin_sync(office_id, entity_type).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                // Another sync holds the slot; this delivery completes as a
                // no-op rather than running twice
                warn!(office_id = %office_id, entity_type = %entity_type, "{msg}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        // The next incremental run picks up from this run's start, so
        // records updated while we paginate are re-pulled rather than missed
        let run_started = Utc::now();

        match self.pull_all(office_id, entity_type, cursor.as_deref()).await {
            Ok(PullResult::Cancelled) => {
                // cancel_sync already wrote the outcome; do not overwrite it
                info!(office_id = %office_id, entity_type = %entity_type, "Sync stopped by cancellation");
                Ok(())
            }
            Ok(PullResult::Finished { synced, failed }) => {
                let outcome = SyncOutcome {
                    success: true,
                    error: None,
                    cursor: Some(run_started.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    records_synced: synced,
                    records_failed: failed,
                };
                self.ctx
                    .sync_status
                    .complete_sync(office_id, entity_type, &outcome)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let outcome = SyncOutcome {
                    success: false,
                    error: Some(e.to_string()),
                    cursor: None,
                    records_synced: 0,
                    records_failed: 0,
                };
                if let Err(complete_err) = self
                    .ctx
                    .sync_status
                    .complete_sync(office_id, entity_type, &outcome)
                    .await
                {
                    error!(
                        office_id = %office_id,
                        entity_type = %entity_type,
                        error = %complete_err,
                        "Failed to record sync failure"
                    );
                }
                Err(e)
            }
        }
    }
}
