//! Queue worker: polls for jobs and dispatches them by name.

use cb_client::BackoffPolicy;
use cb_queue::{JobConsumer, QueuedJob};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::JobHandler;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Upper bound on jobs processed concurrently. The rate limiter inside
    /// the client bounds legacy throughput regardless of this value.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            concurrency: 4,
        }
    }
}

pub struct JobWorker {
    consumer: Arc<dyn JobConsumer>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    backoff: BackoffPolicy,
    config: WorkerConfig,
    running: Arc<RwLock<bool>>,
}

impl JobWorker {
    pub fn new(consumer: Arc<dyn JobConsumer>, backoff: BackoffPolicy, config: WorkerConfig) -> Self {
        Self {
            consumer,
            handlers: HashMap::new(),
            backoff,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            warn!("Worker already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            handlers = self.handlers.len(),
            "Starting job worker"
        );

        let consumer = self.consumer.clone();
        let handlers = Arc::new(self.handlers.clone());
        let backoff = self.backoff.clone();
        let running = self.running.clone();
        let poll_interval = self.config.poll_interval;
        let batch_size = self.config.batch_size;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        tokio::spawn(async move {
            let mut interval = interval(poll_interval);
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }

                let jobs = match consumer.poll(batch_size).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(error = %e, "Queue poll failed");
                        continue;
                    }
                };

                for job in jobs {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let consumer = consumer.clone();
                    let handlers = handlers.clone();
                    let backoff = backoff.clone();
                    tokio::spawn(async move {
                        dispatch(consumer, handlers, backoff, job).await;
                        drop(permit);
                    });
                }
            }
            info!("Job worker stopped");
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Job worker stopping");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn dispatch(
    consumer: Arc<dyn JobConsumer>,
    handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    backoff: BackoffPolicy,
    job: QueuedJob,
) {
    let name = job.job.name.clone();
    let receipt = job.receipt_handle.clone();

    let Some(handler) = handlers.get(name.as_str()) else {
        error!(job_name = %name, "No handler registered, sending job to dead state");
        if let Err(e) = consumer.kill(&receipt, Some("no handler registered")).await {
            error!(error = %e, "Failed to kill unroutable job");
        }
        return;
    };

    match handler.handle(&job).await {
        Ok(()) => {
            debug!(job_name = %name, attempt = job.attempt, "Job completed");
            if let Err(e) = consumer.ack(&receipt).await {
                error!(error = %e, "Failed to ack completed job");
            }
        }
        Err(e) if e.retryable() => {
            let delay = backoff.base_delay_for_attempt(job.attempt).as_secs() as u32;
            warn!(
                job_name = %name,
                attempt = job.attempt,
                delay_seconds = delay,
                error = %e,
                "Job failed, scheduling retry"
            );
            if let Err(nack_err) = consumer
                .nack(&receipt, Some(delay), Some(&e.to_string()))
                .await
            {
                error!(error = %nack_err, "Failed to nack job");
            }
        }
        Err(e) => {
            error!(job_name = %name, error = %e, "Job failed permanently");
            if let Err(kill_err) = consumer.kill(&receipt, Some(&e.to_string())).await {
                error!(error = %kill_err, "Failed to kill job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use cb_common::OfficeId;
    use cb_queue::{EmbeddedJobQueue, Job, JobPublisher, SqliteJobQueue};
    use sqlx::SqlitePool;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        result: fn() -> Result<(), EngineError>,
    }

    #[async_trait::async_trait]
    impl JobHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(&self, _job: &QueuedJob) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    async fn test_queue() -> Arc<SqliteJobQueue> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let queue = SqliteJobQueue::new(pool, "worker-test".to_string(), 30, 5);
        queue.init_schema().await.unwrap();
        Arc::new(queue)
    }

    fn fast_worker(queue: Arc<SqliteJobQueue>) -> JobWorker {
        JobWorker::new(
            queue,
            BackoffPolicy::default(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn successful_job_is_acked() {
        let queue = test_queue().await;
        let calls = Arc::new(AtomicU32::new(0));

        let mut worker = fast_worker(queue.clone());
        worker.register(Arc::new(CountingHandler {
            calls: calls.clone(),
            result: || Ok(()),
        }));
        worker.start().await;

        queue
            .publish(Job::new("counting", OfficeId::new(), "j1".to_string(), &()).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.pending_jobs, 0);
        assert_eq!(metrics.in_flight_jobs, 0);
        assert_eq!(metrics.dead_jobs, 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_goes_dead_without_retry() {
        let queue = test_queue().await;
        let calls = Arc::new(AtomicU32::new(0));

        let mut worker = fast_worker(queue.clone());
        worker.register(Arc::new(CountingHandler {
            calls: calls.clone(),
            result: || Err(EngineError::Payload("garbage".to_string())),
        }));
        worker.start().await;

        queue
            .publish(Job::new("counting", OfficeId::new(), "j2".to_string(), &()).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("garbage"));
    }

    #[tokio::test]
    async fn unroutable_job_goes_dead() {
        let queue = test_queue().await;

        let worker = fast_worker(queue.clone());
        worker.start().await;

        queue
            .publish(Job::new("unknown-job", OfficeId::new(), "j3".to_string(), &()).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
    }
}
