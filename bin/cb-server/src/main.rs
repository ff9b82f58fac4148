//! CaseBridge synchronization engine server.
//!
//! Wires the legacy API client, shadow store, job queue, worker and
//! scheduler together and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use cb_client::models::LegacyEmail;
use cb_client::{BackoffPolicy, LegacyApiClient, LegacyClientConfig, RateLimiters};
use cb_common::OfficeId;
use cb_config::AppConfig;
use cb_engine::{
    CleanupHandler, EngineError, JobContext, JobWorker, PushJobHandler, SchedulerSettings,
    SyncAllHandler, SyncJobHandler, SyncScheduler, TriageJobHandler, TriageService, WorkerConfig,
};
use cb_queue::{EmbeddedJobQueue, JobConsumer, SqliteJobQueue};
use chrono::Duration as ChronoDuration;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

mod credentials;

use credentials::SqliteCredentialStore;

/// Placeholder triage implementation. The real triage subsystem registers
/// its own service here; until then inbound emails are logged and left
/// unactioned so nothing is lost.
struct LoggingTriageService;

#[async_trait::async_trait]
impl TriageService for LoggingTriageService {
    async fn process_email(
        &self,
        office_id: OfficeId,
        email: &LegacyEmail,
    ) -> Result<(), EngineError> {
        warn!(
            office_id = %office_id,
            external_id = %email.id,
            "No triage subsystem configured, leaving email unactioned"
        );
        Err(EngineError::Triage("triage subsystem not configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cb_common::logging::init_logging("cb-server");

    info!("Starting CaseBridge synchronization engine");

    let config = AppConfig::load()?;
    info!(
        database = %config.database.url,
        rps = config.legacy.requests_per_second,
        per_office = config.legacy.per_office_rate_limit,
        disabled = config.legacy.disabled,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    cb_store::init_schema(&pool).await?;

    let credential_store = Arc::new(SqliteCredentialStore::new(pool.clone()));
    credential_store.init_schema().await?;

    let queue = Arc::new(SqliteJobQueue::new(
        pool.clone(),
        config.queue.queue_name.clone(),
        config.queue.visibility_timeout_secs,
        config.queue.max_attempts,
    ));
    queue.init_schema().await?;

    let limiters = if config.legacy.per_office_rate_limit {
        RateLimiters::per_office(config.legacy.requests_per_second)
    } else {
        RateLimiters::global(config.legacy.requests_per_second)
    };

    let client_config = LegacyClientConfig {
        vendor_domain: config.legacy.vendor_domain.clone(),
        auth_locale: config.legacy.auth_locale.clone(),
        token_lifetime: ChronoDuration::minutes(config.legacy.token_lifetime_minutes),
        token_refresh_margin: ChronoDuration::minutes(config.legacy.token_refresh_margin_minutes),
        connect_timeout: Duration::from_secs(config.legacy.connect_timeout_secs),
        request_timeout: Duration::from_secs(config.legacy.request_timeout_secs),
        max_retries: config.legacy.max_retries,
        backoff_base: Duration::from_millis(config.legacy.backoff_base_ms),
        backoff_max: Duration::from_millis(config.legacy.backoff_max_ms),
        disabled: config.legacy.disabled,
    };
    let client = Arc::new(LegacyApiClient::new(
        client_config,
        credential_store.clone(),
        limiters,
    )?);

    let ctx = Arc::new(JobContext::new(pool.clone(), client, queue.clone()));

    let retry_backoff = BackoffPolicy::new(
        Duration::from_millis(config.legacy.backoff_base_ms),
        Duration::from_millis(config.legacy.backoff_max_ms),
        config.queue.max_attempts,
    );
    let mut worker = JobWorker::new(
        queue.clone(),
        retry_backoff,
        WorkerConfig {
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
            batch_size: config.queue.poll_batch,
            concurrency: config.queue.worker_concurrency as usize,
        },
    );
    worker.register(Arc::new(SyncJobHandler::new(ctx.clone())));
    worker.register(Arc::new(SyncAllHandler::new(ctx.clone())));
    worker.register(Arc::new(PushJobHandler::new(ctx.clone())));
    worker.register(Arc::new(CleanupHandler::new(ctx.clone())));
    worker.register(Arc::new(TriageJobHandler::new(
        ctx.clone(),
        Arc::new(LoggingTriageService),
    )));
    worker.start().await;

    let scheduler = SyncScheduler::new(
        queue.clone(),
        credential_store.clone(),
        SchedulerSettings {
            enabled: config.scheduler.enabled,
            incremental_interval: Duration::from_secs(config.scheduler.incremental_interval_secs),
            full_sync_interval: Duration::from_secs(config.scheduler.full_sync_interval_secs),
            cleanup_interval: Duration::from_secs(config.scheduler.cleanup_interval_secs),
            reference_stale_after_days: config.scheduler.reference_stale_after_days,
        },
    );
    scheduler.start().await;

    if config.dev_mode {
        // Kick one incremental round immediately instead of waiting a full
        // interval
        scheduler.trigger_sync_all(false).await?;
    }

    info!("Engine running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.stop().await;
    worker.stop().await;
    queue.stop().await;
    pool.close().await;

    info!("CaseBridge server stopped");
    Ok(())
}
