//! Durable job queue for the synchronization engine.
//!
//! The queue supplies at-least-once delivery with visibility timeouts,
//! deduplicated enqueue and per-job retry bookkeeping. Handlers must accept
//! replay of the same payload without corrupting state; jobs that exhaust
//! their attempts land in a dead state for manual inspection.

use async_trait::async_trait;
use cb_common::OfficeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod sqlite;

pub use error::QueueError;
pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// A job to be enqueued. Payloads are versioned plain records keyed by
/// office id plus entity identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Stable job-name string (see `cb_common::job_names`) used for routing.
    pub name: String,
    pub office_id: OfficeId,
    /// Duplicate publishes with the same dedup id are silently dropped.
    pub dedup_id: String,
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new<P: Serialize>(
        name: &str,
        office_id: OfficeId,
        dedup_id: String,
        payload: &P,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            office_id,
            dedup_id,
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// A job received from the queue with delivery metadata
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: Job,
    pub receipt_handle: String,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub queue_identifier: String,
}

impl QueuedJob {
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }
}

/// A job that exhausted its retry budget, kept for manual inspection
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: Job,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Queue metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub pending_jobs: u64,
    pub in_flight_jobs: u64,
    pub dead_jobs: u64,
    pub queue_identifier: String,
}

/// Trait for consuming jobs from a queue
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Get the unique identifier for this consumer
    fn identifier(&self) -> &str;

    /// Poll for jobs from the queue
    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueuedJob>>;

    /// Acknowledge a job (remove from queue)
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Negative acknowledge a job (make visible again after delay).
    /// Jobs past their attempt budget move to the dead state instead,
    /// with `error` recorded for inspection.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>, error: Option<&str>)
        -> Result<()>;

    /// Move a job straight to the dead state, bypassing remaining retries.
    /// Used for failures that no amount of redelivery can fix.
    async fn kill(&self, receipt_handle: &str, error: Option<&str>) -> Result<()>;

    /// Extend visibility timeout for a job
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Check if the consumer is healthy
    fn is_healthy(&self) -> bool;

    /// Stop the consumer
    async fn stop(&self);

    /// Get queue metrics (pending/in-flight/dead counts)
    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Trait for publishing jobs to a queue
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Get the queue identifier
    fn identifier(&self) -> &str;

    /// Publish a single job. Returns the job id; duplicate dedup ids are a
    /// no-op and return the original id.
    async fn publish(&self, job: Job) -> Result<String>;

    /// Publish a batch of jobs
    async fn publish_batch(&self, jobs: Vec<Job>) -> Result<Vec<String>>;
}

/// Combined consumer and publisher for embedded mode
#[async_trait]
pub trait EmbeddedJobQueue: JobConsumer + JobPublisher {
    /// Initialize the queue schema (create tables, etc.)
    async fn init_schema(&self) -> Result<()>;

    /// List dead jobs for manual inspection
    async fn list_dead(&self, limit: u32) -> Result<Vec<DeadJob>>;
}
