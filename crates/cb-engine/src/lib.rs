//! Job handlers, worker and scheduler: the queue-driven heart of the
//! synchronization engine.
//!
//! Every unit of work arrives as a queued job and is dispatched by name to a
//! handler. Handlers are idempotent because the queue is at-least-once:
//! replaying any payload must not duplicate shadow rows or legacy records.

use cb_client::{ApiError, LegacyApiClient};
use cb_queue::{JobPublisher, QueueError, QueuedJob};
use cb_store::{
    AuditLogStore, ReferenceRepo, ShadowRepo, StoreError, SyncStatusStore,
};
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod handlers;
pub mod scheduler;
pub mod worker;

pub use handlers::{
    CleanupHandler, PushJobHandler, SyncAllHandler, SyncJobHandler, TriageJobHandler,
    TriageService,
};
pub use scheduler::{OfficeDirectory, SchedulerSettings, StaticOfficeDirectory, SyncScheduler};
pub use worker::{JobWorker, WorkerConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Legacy API error: {0}")]
    Api(#[from] ApiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Malformed or stale job payload. Redelivery cannot fix this, so the
    /// worker sends the job straight to the dead state.
    #[error("Bad payload: {0}")]
    Payload(String),

    #[error("Triage error: {0}")]
    Triage(String),
}

impl EngineError {
    /// Whether a later redelivery of the same job could plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            // The client already burned its own retry budget on 429s and
            // transport failures, but the condition is transient at job
            // timescales. Server errors likewise.
            EngineError::Api(e) => matches!(
                e,
                ApiError::RateLimited | ApiError::Transport(_) | ApiError::Server { .. }
            ),
            EngineError::Store(StoreError::Database(_)) => true,
            EngineError::Store(_) => false,
            EngineError::Queue(QueueError::Database(_)) => true,
            EngineError::Queue(_) => false,
            EngineError::Payload(_) => false,
            EngineError::Triage(_) => true,
        }
    }
}

/// Shared collaborators handed to every handler.
pub struct JobContext {
    pub pool: SqlitePool,
    pub client: Arc<LegacyApiClient>,
    pub sync_status: SyncStatusStore,
    pub audit: AuditLogStore,
    pub reference: ReferenceRepo,
    pub publisher: Arc<dyn JobPublisher>,
}

impl JobContext {
    pub fn new(
        pool: SqlitePool,
        client: Arc<LegacyApiClient>,
        publisher: Arc<dyn JobPublisher>,
    ) -> Self {
        Self {
            sync_status: SyncStatusStore::new(pool.clone()),
            audit: AuditLogStore::new(pool.clone()),
            reference: ReferenceRepo::new(pool.clone()),
            pool,
            client,
            publisher,
        }
    }

    /// Shadow repository for a domain entity type; `None` for reference
    /// types.
    pub fn shadow_repo(&self, entity_type: cb_common::EntityType) -> Option<ShadowRepo> {
        ShadowRepo::for_entity(self.pool.clone(), entity_type)
    }
}

/// One queue job kind. Implementations must tolerate duplicate delivery of
/// the same payload.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// The job-name routing key this handler owns.
    fn name(&self) -> &'static str;

    async fn handle(&self, job: &QueuedJob) -> Result<(), EngineError>;
}
