//! Hand newly-synced inbound emails to the triage subsystem.
//!
//! The engine only owns the job-type boundary: fetch the email, delegate,
//! then mark it actioned upstream so the legacy inbox stops reporting it.

use cb_client::models::LegacyEmail;
use cb_common::{job_names, OfficeId, TriageJobPayload};
use cb_queue::QueuedJob;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{EngineError, JobContext, JobHandler};

#[async_trait::async_trait]
pub trait TriageService: Send + Sync {
    async fn process_email(
        &self,
        office_id: OfficeId,
        email: &LegacyEmail,
    ) -> Result<(), EngineError>;
}

pub struct TriageJobHandler {
    ctx: Arc<JobContext>,
    service: Arc<dyn TriageService>,
}

impl TriageJobHandler {
    pub fn new(ctx: Arc<JobContext>, service: Arc<dyn TriageService>) -> Self {
        Self { ctx, service }
    }
}

#[async_trait::async_trait]
impl JobHandler for TriageJobHandler {
    fn name(&self) -> &'static str {
        job_names::TRIAGE_PROCESS_EMAIL
    }

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError> {
        let payload: TriageJobPayload = job
            .payload()
            .map_err(|e| EngineError::Payload(e.to_string()))?;

        let email = match self
            .ctx
            .client
            .get_email(payload.office_id, payload.external_email_id)
            .await?
        {
            Some(email) => email,
            None => {
                warn!(
                    office_id = %payload.office_id,
                    external_email_id = %payload.external_email_id,
                    "Email no longer exists upstream, skipping triage"
                );
                return Ok(());
            }
        };

        // Duplicate delivery after a completed triage is a no-op
        if email.actioned {
            return Ok(());
        }

        self.service
            .process_email(payload.office_id, &email)
            .await?;
        self.ctx
            .client
            .mark_email_actioned(payload.office_id, payload.external_email_id)
            .await?;

        info!(
            office_id = %payload.office_id,
            external_email_id = %payload.external_email_id,
            "Email triaged and marked actioned"
        );
        Ok(())
    }
}
