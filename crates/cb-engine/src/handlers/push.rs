//! Mirror a local mutation to the legacy system.

use cb_common::{
    job_names, AuditLogEntry, AuditOperation, PushJobPayload, PushOperation,
};
use cb_queue::QueuedJob;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{EngineError, JobContext, JobHandler};

pub struct PushJobHandler {
    ctx: Arc<JobContext>,
}

impl PushJobHandler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl JobHandler for PushJobHandler {
    fn name(&self) -> &'static str {
        job_names::PUSH_ENTITY
    }

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError> {
        let payload: PushJobPayload = job
            .payload()
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        let office_id = payload.office_id;
        let entity_type = payload.entity_type;

        let repo = self
            .ctx
            .shadow_repo(entity_type)
            .ok_or_else(|| EngineError::Payload(format!("{entity_type} cannot be pushed")))?;

        // The shadow row is the source of truth for what gets pushed; the
        // payload only identifies it
        let row = repo.get(payload.internal_id).await?.ok_or_else(|| {
            EngineError::Payload(format!("no local {entity_type} row {}", payload.internal_id))
        })?;

        let external_id = row.external_id.or(payload.external_id);

        match (payload.operation, external_id) {
            (PushOperation::Create, None) => {
                match self
                    .ctx
                    .client
                    .create_record(office_id, entity_type, &row.data)
                    .await
                {
                    Ok(new_id) => {
                        repo.update_external_id(payload.internal_id, new_id).await?;
                        self.ctx
                            .audit
                            .append(
                                &AuditLogEntry::new(office_id, entity_type, AuditOperation::Create)
                                    .with_external_id(new_id)
                                    .with_internal_id(payload.internal_id)
                                    .with_new_data(row.data.clone()),
                            )
                            .await?;
                        info!(
                            office_id = %office_id,
                            entity_type = %entity_type,
                            external_id = %new_id,
                            "Created legacy record"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        self.ctx
                            .audit
                            .append(
                                &AuditLogEntry::new(office_id, entity_type, AuditOperation::Create)
                                    .with_internal_id(payload.internal_id)
                                    .with_error(e.to_string()),
                            )
                            .await?;
                        Err(e.into())
                    }
                }
            }
            // A redelivered create whose first attempt already assigned an
            // external id must not create a second legacy record
            (PushOperation::Create, Some(id)) | (PushOperation::Update, Some(id)) => {
                if payload.operation == PushOperation::Create {
                    debug!(
                        office_id = %office_id,
                        external_id = %id,
                        "Create already applied upstream, short-circuiting to update"
                    );
                }
                match self
                    .ctx
                    .client
                    .update_record(office_id, entity_type, id, &row.data)
                    .await
                {
                    Ok(()) => {
                        self.ctx
                            .audit
                            .append(
                                &AuditLogEntry::new(office_id, entity_type, AuditOperation::Update)
                                    .with_external_id(id)
                                    .with_internal_id(payload.internal_id)
                                    .with_new_data(row.data.clone()),
                            )
                            .await?;
                        Ok(())
                    }
                    Err(e) => {
                        self.ctx
                            .audit
                            .append(
                                &AuditLogEntry::new(office_id, entity_type, AuditOperation::Update)
                                    .with_external_id(id)
                                    .with_internal_id(payload.internal_id)
                                    .with_error(e.to_string()),
                            )
                            .await?;
                        Err(e.into())
                    }
                }
            }
            (PushOperation::Update, None) => Err(EngineError::Payload(
                "update push for a row with no external id".to_string(),
            )),
        }
    }
}
