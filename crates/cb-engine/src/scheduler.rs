//! Recurring schedules: incremental polls, daily full syncs, reference
//! cleanup.
//!
//! The scheduler only enqueues; the worker and handlers do the work. That
//! keeps the cadence loops trivial and pushes all retry and overlap handling
//! into one place.

use cb_common::{job_names, CleanupPayload, OfficeId, SyncAllPayload};
use cb_queue::{Job, JobPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::EngineError;

/// Supplies the offices the engine should keep in sync.
#[async_trait::async_trait]
pub trait OfficeDirectory: Send + Sync {
    async fn active_offices(&self) -> Result<Vec<OfficeId>, EngineError>;
}

/// Fixed office list, fed from configuration at startup.
pub struct StaticOfficeDirectory {
    offices: Vec<OfficeId>,
}

impl StaticOfficeDirectory {
    pub fn new(offices: Vec<OfficeId>) -> Self {
        Self { offices }
    }
}

#[async_trait::async_trait]
impl OfficeDirectory for StaticOfficeDirectory {
    async fn active_offices(&self) -> Result<Vec<OfficeId>, EngineError> {
        Ok(self.offices.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub incremental_interval: Duration,
    pub full_sync_interval: Duration,
    pub cleanup_interval: Duration,
    pub reference_stale_after_days: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            incremental_interval: Duration::from_secs(300),
            full_sync_interval: Duration::from_secs(86400),
            cleanup_interval: Duration::from_secs(86400),
            reference_stale_after_days: 7,
        }
    }
}

pub struct SyncScheduler {
    publisher: Arc<dyn JobPublisher>,
    offices: Arc<dyn OfficeDirectory>,
    settings: SchedulerSettings,
    running: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    pub fn new(
        publisher: Arc<dyn JobPublisher>,
        offices: Arc<dyn OfficeDirectory>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            publisher,
            offices,
            settings,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        if !self.settings.enabled {
            info!("Sync scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(
            incremental_secs = self.settings.incremental_interval.as_secs(),
            full_sync_secs = self.settings.full_sync_interval.as_secs(),
            cleanup_secs = self.settings.cleanup_interval.as_secs(),
            "Starting sync scheduler"
        );

        self.spawn_sync_loop(self.settings.incremental_interval, false);
        self.spawn_sync_loop(self.settings.full_sync_interval, true);
        self.spawn_cleanup_loop();
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Sync scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    fn spawn_sync_loop(&self, period: Duration, full: bool) {
        let publisher = self.publisher.clone();
        let offices = self.offices.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut interval = interval(period);
            // The immediate first tick would fire a full sync of every
            // office at every process start
            interval.tick().await;
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = enqueue_sync_all(&publisher, offices.as_ref(), full).await {
                    error!(error = %e, full = full, "Failed to enqueue scheduled syncs");
                }
            }
        });
    }

    fn spawn_cleanup_loop(&self) {
        let publisher = self.publisher.clone();
        let offices = self.offices.clone();
        let running = self.running.clone();
        let period = self.settings.cleanup_interval;
        let stale_after_days = self.settings.reference_stale_after_days;

        tokio::spawn(async move {
            let mut interval = interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = enqueue_cleanup(&publisher, offices.as_ref(), stale_after_days).await
                {
                    error!(error = %e, "Failed to enqueue reference cleanup");
                }
            }
        });
    }

    /// Enqueue one round immediately, outside the recurring cadence. Used at
    /// startup and by operators.
    pub async fn trigger_sync_all(&self, full: bool) -> Result<(), EngineError> {
        enqueue_sync_all(&self.publisher, self.offices.as_ref(), full).await
    }
}

async fn enqueue_sync_all(
    publisher: &Arc<dyn JobPublisher>,
    offices: &dyn OfficeDirectory,
    full: bool,
) -> Result<(), EngineError> {
    let kind = if full { "full" } else { "inc" };
    for office_id in offices.active_offices().await? {
        let payload = SyncAllPayload { office_id, full };
        let job = Job::new(
            job_names::SYNC_ALL,
            office_id,
            format!("sync-all-{kind}-{office_id}"),
            &payload,
        )?;
        publisher.publish(job).await?;
    }
    Ok(())
}

async fn enqueue_cleanup(
    publisher: &Arc<dyn JobPublisher>,
    offices: &dyn OfficeDirectory,
    stale_after_days: i64,
) -> Result<(), EngineError> {
    for office_id in offices.active_offices().await? {
        let payload = CleanupPayload {
            office_id,
            stale_after_days,
        };
        let job = Job::new(
            job_names::CLEANUP_REFERENCE_DATA,
            office_id,
            format!("cleanup-{office_id}"),
            &payload,
        )?;
        publisher.publish(job).await?;
    }
    Ok(())
}
