//! End-to-end engine tests: a wiremock legacy instance, an in-memory shadow
//! database, and real handlers.

use cb_client::{
    Credentials, InMemoryCredentialStore, LegacyApiClient, LegacyClientConfig, RateLimiters,
};
use cb_common::{
    job_names, AuditOperation, EntityType, ExternalId, OfficeId, PushJobPayload, PushOperation,
    SyncJobPayload,
};
use cb_engine::{JobContext, JobHandler, PushJobHandler, SyncJobHandler};
use cb_queue::{EmbeddedJobQueue, Job, JobConsumer, QueuedJob, SqliteJobQueue};
use cb_store::{QuerySpec, ShadowRepo, SyncStatusStore, CANCELLED_BY_USER};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct Harness {
    ctx: Arc<JobContext>,
    queue: Arc<SqliteJobQueue>,
    pool: SqlitePool,
    office_id: OfficeId,
}

async fn harness(server: &MockServer) -> Harness {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    cb_store::init_schema(&pool).await.unwrap();

    let queue = Arc::new(SqliteJobQueue::new(
        pool.clone(),
        "engine-test".to_string(),
        30,
        5,
    ));
    queue.init_schema().await.unwrap();

    let office_id = OfficeId::new();
    let creds = InMemoryCredentialStore::new();
    creds.insert(Credentials {
        office_id,
        api_host: server.uri(),
        email: "sync@office.example.org".to_string(),
        password: "hunter2".to_string(),
        cached_token: None,
        token_expires_at: None,
    });

    let client = LegacyApiClient::new(
        LegacyClientConfig {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..LegacyClientConfig::default()
        },
        Arc::new(creds),
        RateLimiters::global(200.0),
    )
    .unwrap();

    let ctx = Arc::new(JobContext::new(
        pool.clone(),
        Arc::new(client),
        queue.clone(),
    ));

    Harness {
        ctx,
        queue,
        pool,
        office_id,
    }
}

async fn mount_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(server)
        .await;
}

fn delivery(name: &str, office_id: OfficeId, payload: &impl serde::Serialize) -> QueuedJob {
    QueuedJob {
        job: Job::new(name, office_id, format!("test-{}", uuid::Uuid::new_v4()), payload).unwrap(),
        receipt_handle: "receipt".to_string(),
        attempt: 1,
        queue_identifier: "engine-test".to_string(),
    }
}

fn constituent_page(ids: std::ops::RangeInclusive<i64>, page: u32, total_pages: u32) -> serde_json::Value {
    let items: Vec<serde_json::Value> = ids
        .map(|id| serde_json::json!({"id": id, "firstName": format!("c{id}")}))
        .collect();
    serde_json::json!({"items": items, "page": page, "totalPages": total_pages})
}

#[tokio::test]
async fn sync_two_pages_end_to_end() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .and(body_partial_json(serde_json::json!({"page": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(constituent_page(1..=50, 1, 2)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .and(body_partial_json(serde_json::json!({"page": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(constituent_page(51..=60, 2, 2)))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let handler = SyncJobHandler::new(h.ctx.clone());

    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        cursor: None,
        full: false,
    };
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let repo = ShadowRepo::constituents(h.pool.clone());
    let rows = repo.list(&QuerySpec::for_office(h.office_id)).await.unwrap();
    assert_eq!(rows.len(), 60);

    let status = SyncStatusStore::new(h.pool.clone())
        .get(h.office_id, EntityType::Constituents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.records_synced, 60);
    assert_eq!(status.records_failed, 0);
    assert_eq!(status.last_sync_success, Some(true));
    assert!(status.cursor.is_some());

    assert_eq!(h.ctx.audit.count_conflicts(h.office_id).await.unwrap(), 0);

    // Replaying the same delivery lands on the same rows
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();
    let rows = repo.list(&QuerySpec::for_office(h.office_id)).await.unwrap();
    assert_eq!(rows.len(), 60);
}

#[tokio::test]
async fn bad_record_does_not_abort_the_batch() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"id": 1, "firstName": "ok"},
                {"firstName": "no id at all"},
                {"id": 3, "firstName": "also ok"}
            ],
            "page": 1,
            "totalPages": 1
        })))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let handler = SyncJobHandler::new(h.ctx.clone());
    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        cursor: None,
        full: false,
    };
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let status = SyncStatusStore::new(h.pool.clone())
        .get(h.office_id, EntityType::Constituents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.records_synced, 2);
    assert_eq!(status.records_failed, 1);
    assert_eq!(status.last_sync_success, Some(true));

    let audited = h
        .ctx
        .audit
        .list(&QuerySpec::for_office(h.office_id))
        .await
        .unwrap();
    assert_eq!(audited.len(), 1);
    assert!(audited[0].error_message.is_some());
}

#[tokio::test]
async fn overlapping_sync_delivery_is_a_no_op() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    // Any search request would be an overlap violation
    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(constituent_page(1..=1, 1, 1)))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let sync_status = SyncStatusStore::new(h.pool.clone());
    sync_status
        .begin_sync(h.office_id, EntityType::Constituents)
        .await
        .unwrap();

    let handler = SyncJobHandler::new(h.ctx.clone());
    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        cursor: None,
        full: false,
    };
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let status = sync_status
        .get(h.office_id, EntityType::Constituents)
        .await
        .unwrap()
        .unwrap();
    assert!(status.is_in_progress());
}

/// Cancels the running sync as a side effect of serving a page, so the
/// cancellation is guaranteed to land between page fetches.
struct CancelWhileResponding {
    sync_status: SyncStatusStore,
    office_id: OfficeId,
    body: serde_json::Value,
}

impl Respond for CancelWhileResponding {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let store = self.sync_status.clone();
        let office_id = self.office_id;
        // Respond is synchronous; run the cancel on its own runtime
        std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(store.cancel_sync(office_id, EntityType::Constituents))
        })
        .join()
        .unwrap()
        .unwrap();
        ResponseTemplate::new(200).set_body_json(self.body.clone())
    }
}

#[tokio::test]
async fn cancelling_mid_run_stops_before_the_next_page() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let h = harness(&server).await;
    let sync_status = SyncStatusStore::new(h.pool.clone());

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .and(body_partial_json(serde_json::json!({"page": 1})))
        .respond_with(CancelWhileResponding {
            sync_status: sync_status.clone(),
            office_id: h.office_id,
            body: constituent_page(1..=50, 1, 2),
        })
        .expect(1)
        .mount(&server)
        .await;
    // The second page must never be fetched after the cancel
    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .and(body_partial_json(serde_json::json!({"page": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(constituent_page(51..=60, 2, 2)))
        .expect(0)
        .mount(&server)
        .await;

    let handler = SyncJobHandler::new(h.ctx.clone());
    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        cursor: None,
        full: false,
    };
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    // The cancel outcome stays on the row; the handler does not overwrite it
    let status = sync_status
        .get(h.office_id, EntityType::Constituents)
        .await
        .unwrap()
        .unwrap();
    assert!(!status.is_in_progress());
    assert_eq!(status.last_sync_error.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(status.last_sync_success, Some(false));

    // Records pulled before the stop are kept
    let repo = ShadowRepo::constituents(h.pool.clone());
    let rows = repo
        .list(&QuerySpec::for_office(h.office_id))
        .await
        .unwrap();
    assert_eq!(rows.len(), 50);
}

#[tokio::test]
async fn syncing_emails_enqueues_triage_for_new_ones() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/inbox/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {"id": 10, "subject": "help with housing"},
                {"id": 11, "subject": "benefits question"}
            ],
            "page": 1,
            "totalPages": 1
        })))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let handler = SyncJobHandler::new(h.ctx.clone());
    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Emails,
        cursor: None,
        full: false,
    };
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let jobs = h.queue.poll(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs
        .iter()
        .all(|j| j.job.name == job_names::TRIAGE_PROCESS_EMAIL));

    // A second sync of the same emails enqueues nothing new
    handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap();
    let more = h.queue.poll(10).await.unwrap();
    assert!(more.is_empty());
}

#[tokio::test]
async fn push_create_assigns_external_id_and_redelivery_updates() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 500})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/ajax/constituents/500"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let repo = ShadowRepo::constituents(h.pool.clone());
    let internal_id = repo
        .create_local(h.office_id, &serde_json::json!({"firstName": "Local"}))
        .await
        .unwrap();

    let handler = PushJobHandler::new(h.ctx.clone());
    let payload = PushJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        internal_id,
        external_id: None,
        operation: PushOperation::Create,
    };

    handler
        .handle(&delivery(job_names::PUSH_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let row = repo.get(internal_id).await.unwrap().unwrap();
    assert_eq!(row.external_id, ExternalId::from_trusted(500));

    // Redelivery of the same create must not POST a second record
    handler
        .handle(&delivery(job_names::PUSH_ENTITY, h.office_id, &payload))
        .await
        .unwrap();

    let audited = h
        .ctx
        .audit
        .list(&QuerySpec::for_office(h.office_id))
        .await
        .unwrap();
    assert_eq!(audited.len(), 2);
    assert!(audited.iter().any(|e| e.operation == AuditOperation::Create));
    assert!(audited.iter().any(|e| e.operation == AuditOperation::Update));
}

#[tokio::test]
async fn failed_push_is_audited_and_surfaces() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/cases"))
        .respond_with(ResponseTemplate::new(422).set_body_string("missing constituent"))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let repo = ShadowRepo::cases(h.pool.clone());
    let internal_id = repo
        .create_local(h.office_id, &serde_json::json!({"subject": "orphan"}))
        .await
        .unwrap();

    let handler = PushJobHandler::new(h.ctx.clone());
    let payload = PushJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Cases,
        internal_id,
        external_id: None,
        operation: PushOperation::Create,
    };

    let error = handler
        .handle(&delivery(job_names::PUSH_ENTITY, h.office_id, &payload))
        .await
        .unwrap_err();
    assert!(!error.retryable());

    let audited = h
        .ctx
        .audit
        .list(&QuerySpec::for_office(h.office_id))
        .await
        .unwrap();
    assert_eq!(audited.len(), 1);
    assert!(audited[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("missing constituent"));

    // No external id was assigned
    let row = repo.get(internal_id).await.unwrap().unwrap();
    assert!(row.external_id.is_none());
}

#[tokio::test]
async fn retrieval_failure_records_unsuccessful_sync() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database offline"))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let handler = SyncJobHandler::new(h.ctx.clone());
    let payload = SyncJobPayload {
        office_id: h.office_id,
        entity_type: EntityType::Constituents,
        cursor: None,
        full: false,
    };

    let error = handler
        .handle(&delivery(job_names::SYNC_ENTITY, h.office_id, &payload))
        .await
        .unwrap_err();
    assert!(error.retryable());

    let status = SyncStatusStore::new(h.pool.clone())
        .get(h.office_id, EntityType::Constituents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.last_sync_success, Some(false));
    assert!(status
        .last_sync_error
        .as_deref()
        .unwrap()
        .contains("database offline"));
    // The slot is released for the next attempt
    assert!(!status.is_in_progress());
}
