use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    DeadJob, EmbeddedJobQueue, Job, JobConsumer, JobPublisher, QueueError, QueueMetrics, QueuedJob,
    Result,
};

const STATE_PENDING: &str = "pending";
const STATE_DEAD: &str = "dead";

/// SQLite-backed job queue with SQS-like visibility-timeout semantics.
///
/// Rows stay in `queue_jobs` until acked (deleted) or dead-lettered (state
/// flipped to `dead`). A polled row becomes invisible for the configured
/// visibility timeout; if the worker crashes, redelivery happens naturally
/// when the timeout lapses, which is where the at-least-once guarantee comes
/// from.
pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    max_attempts: u32,
    running: AtomicBool,
}

impl SqliteJobQueue {
    pub fn new(
        pool: Pool<Sqlite>,
        queue_name: String,
        visibility_timeout_seconds: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            max_attempts,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                job_name TEXT NOT NULL,
                office_id TEXT NOT NULL,
                dedup_id TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'pending',
                payload TEXT NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Dedup applies to live jobs only. Dead rows keep their dedup_id for
        // inspection but must not block a later enqueue of the same work.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_dedup_live
            ON queue_jobs (queue_name, dedup_id) WHERE state = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for efficient polling
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_visible
            ON queue_jobs (queue_name, state, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite job queue schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn parse_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
        let office_raw: String = row.get("office_id");
        let office_id = office_raw
            .parse::<Uuid>()
            .map(cb_common::OfficeId)
            .map_err(|e| QueueError::Database(format!("corrupt office_id: {e}")))?;
        let payload: String = row.get("payload");

        Ok(Job {
            id: row.get("id"),
            name: row.get("job_name"),
            office_id,
            dedup_id: row.get("dedup_id"),
            payload: serde_json::from_str(&payload)?,
        })
    }
}

#[async_trait]
impl JobConsumer for SqliteJobQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_jobs: u32) -> Result<Vec<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, job_name, office_id, dedup_id, payload, attempts
            FROM queue_jobs
            WHERE queue_name = ? AND state = ? AND visible_at <= ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(STATE_PENDING)
        .bind(now)
        .bind(max_jobs as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let receipt_handle = self.generate_receipt_handle();

            // Claim the row; a concurrent consumer may have taken it already.
            let updated = sqlx::query(
                r#"
                UPDATE queue_jobs
                SET receipt_handle = ?, visible_at = ?, attempts = attempts + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }

            let attempts: i64 = row.get("attempts");
            jobs.push(QueuedJob {
                job: Self::parse_job(&row)?,
                receipt_handle,
                attempt: attempts as u32 + 1,
                queue_identifier: self.queue_name.clone(),
            });
        }

        if !jobs.is_empty() {
            debug!(queue = %self.queue_name, count = jobs.len(), "Polled jobs");
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE receipt_handle = ? AND queue_name = ?")
                .bind(receipt_handle)
                .bind(&self.queue_name)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "ACK failed - job not found or already deleted"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, queue = %self.queue_name, "Job acknowledged");
        Ok(())
    }

    async fn nack(
        &self,
        receipt_handle: &str,
        delay_seconds: Option<u32>,
        error: Option<&str>,
    ) -> Result<()> {
        // Jobs at their attempt budget are dead-lettered instead of retried.
        let dead = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = ?, receipt_handle = NULL, last_error = ?
            WHERE receipt_handle = ? AND queue_name = ? AND attempts >= ?
            "#,
        )
        .bind(STATE_DEAD)
        .bind(error)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .bind(self.max_attempts as i64)
        .execute(&self.pool)
        .await?;

        if dead.rows_affected() > 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                max_attempts = self.max_attempts,
                error = ?error,
                "Job exhausted retries, moved to dead state"
            );
            return Ok(());
        }

        let delay = delay_seconds.unwrap_or(0) as i64;
        let new_visible_at = Utc::now().timestamp() + delay;

        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET visible_at = ?, receipt_handle = NULL, last_error = ?
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(error)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "NACK failed - job not found"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            queue = %self.queue_name,
            delay_seconds = delay,
            "Job negative acknowledged"
        );
        Ok(())
    }

    async fn kill(&self, receipt_handle: &str, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = ?, receipt_handle = NULL, last_error = ?
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(STATE_DEAD)
        .bind(error)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        warn!(
            receipt_handle = %receipt_handle,
            queue = %self.queue_name,
            error = ?error,
            "Job moved to dead state without retry"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp() + seconds as i64;

        let result = sqlx::query(
            "UPDATE queue_jobs SET visible_at = ? WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            queue = %self.queue_name,
            seconds = seconds,
            "Visibility extended"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite job queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let now = Utc::now().timestamp();

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue_name = ? AND state = ? AND visible_at <= ? AND receipt_handle IS NULL",
        )
        .bind(&self.queue_name)
        .bind(STATE_PENDING)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_jobs WHERE queue_name = ? AND receipt_handle IS NOT NULL",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        let dead: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE queue_name = ? AND state = ?")
                .bind(&self.queue_name)
                .bind(STATE_DEAD)
                .fetch_one(&self.pool)
                .await?;

        Ok(Some(QueueMetrics {
            pending_jobs: pending as u64,
            in_flight_jobs: in_flight as u64,
            dead_jobs: dead as u64,
            queue_identifier: self.queue_name.clone(),
        }))
    }
}

#[async_trait]
impl JobPublisher for SqliteJobQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, job: Job) -> Result<String> {
        let now = Utc::now();
        let payload = serde_json::to_string(&job.payload)?;

        // Idempotent enqueue: a live duplicate (pending or in-flight) is a
        // no-op. Dead rows do not count, so a dead-lettered scheduled job
        // never blocks the next tick's enqueue for the same office/entity.
        let existing = sqlx::query(
            "SELECT id FROM queue_jobs WHERE dedup_id = ? AND queue_name = ? AND state = ?",
        )
        .bind(&job.dedup_id)
        .bind(&self.queue_name)
        .bind(STATE_PENDING)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let id: String = row.get("id");
            debug!(
                job_id = %id,
                dedup_id = %job.dedup_id,
                queue = %self.queue_name,
                "Duplicate job detected, skipping"
            );
            return Ok(id);
        }

        sqlx::query(
            r#"
            INSERT INTO queue_jobs
                (id, queue_name, job_name, office_id, dedup_id, visible_at, state, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&self.queue_name)
        .bind(&job.name)
        .bind(job.office_id.to_string())
        .bind(&job.dedup_id)
        .bind(now.timestamp())
        .bind(STATE_PENDING)
        .bind(&payload)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        debug!(
            job_id = %job.id,
            job_name = %job.name,
            office_id = %job.office_id,
            queue = %self.queue_name,
            "Job published"
        );

        Ok(job.id)
    }

    async fn publish_batch(&self, jobs: Vec<Job>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.publish(job).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl EmbeddedJobQueue for SqliteJobQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }

    async fn list_dead(&self, limit: u32) -> Result<Vec<DeadJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, office_id, dedup_id, payload, attempts, last_error
            FROM queue_jobs
            WHERE queue_name = ? AND state = ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(STATE_DEAD)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut dead = Vec::with_capacity(rows.len());
        for row in rows {
            let attempts: i64 = row.get("attempts");
            dead.push(DeadJob {
                job: Self::parse_job(&row)?,
                attempts: attempts as u32,
                last_error: row.get("last_error"),
            });
        }
        Ok(dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_common::{job_names, OfficeId};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_queue(max_attempts: u32) -> SqliteJobQueue {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteJobQueue::new(pool, "test-queue".to_string(), 30, max_attempts);
        queue.init_schema().await.unwrap();
        queue
    }

    fn sync_job(office: OfficeId, dedup: &str) -> Job {
        Job::new(
            job_names::SYNC_ENTITY,
            office,
            dedup.to_string(),
            &serde_json::json!({"entityType": "cases"}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_and_poll() {
        let queue = create_test_queue(5).await;
        let office = OfficeId::new();

        queue.publish(sync_job(office, "job-1")).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.name, job_names::SYNC_ENTITY);
        assert_eq!(jobs[0].job.office_id, office);
        assert_eq!(jobs[0].attempt, 1);

        queue.ack(&jobs[0].receipt_handle).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_nack_with_delay() {
        let queue = create_test_queue(5).await;
        queue
            .publish(sync_job(OfficeId::new(), "job-2"))
            .await
            .unwrap();

        let jobs = queue.poll(10).await.unwrap();
        queue
            .nack(&jobs[0].receipt_handle, Some(60), Some("boom"))
            .await
            .unwrap();

        // Delayed - not yet visible
        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_deduplication() {
        let queue = create_test_queue(5).await;
        let office = OfficeId::new();

        queue.publish(sync_job(office, "dup")).await.unwrap();
        queue.publish(sync_job(office, "dup")).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let queue = create_test_queue(2).await;
        queue
            .publish(sync_job(OfficeId::new(), "doomed"))
            .await
            .unwrap();

        // First delivery fails
        let jobs = queue.poll(10).await.unwrap();
        queue
            .nack(&jobs[0].receipt_handle, Some(0), Some("attempt 1 failed"))
            .await
            .unwrap();

        // Second delivery fails - attempts now at the budget, job dies
        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs[0].attempt, 2);
        queue
            .nack(&jobs[0].receipt_handle, Some(0), Some("attempt 2 failed"))
            .await
            .unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());

        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].last_error.as_deref(), Some("attempt 2 failed"));

        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.dead_jobs, 1);
        assert_eq!(metrics.pending_jobs, 0);
    }

    #[tokio::test]
    async fn test_kill_skips_remaining_retries() {
        let queue = create_test_queue(5).await;
        queue
            .publish(sync_job(OfficeId::new(), "poisoned"))
            .await
            .unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs[0].attempt, 1);
        queue
            .kill(&jobs[0].receipt_handle, Some("malformed payload"))
            .await
            .unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());

        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("malformed payload"));
    }

    #[tokio::test]
    async fn test_dead_job_does_not_block_republish() {
        let queue = create_test_queue(5).await;
        let office = OfficeId::new();

        // Recurring schedules reuse the same dedup id on every tick
        queue
            .publish(sync_job(office, "sync-inc-cases"))
            .await
            .unwrap();
        let jobs = queue.poll(10).await.unwrap();
        queue
            .kill(&jobs[0].receipt_handle, Some("legacy outage"))
            .await
            .unwrap();

        // The dead row must not swallow the next tick's enqueue
        queue
            .publish(sync_job(office, "sync-inc-cases"))
            .await
            .unwrap();
        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);

        // The dead row itself is still there for inspection
        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects_poll() {
        let queue = create_test_queue(5).await;
        queue.stop().await;
        assert!(matches!(queue.poll(1).await, Err(QueueError::Stopped)));
    }
}
