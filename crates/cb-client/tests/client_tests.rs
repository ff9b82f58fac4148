//! Integration tests for the legacy API client.
//!
//! These tests use wiremock as a stand-in legacy instance; credentials come
//! from the in-memory store with the mock server's URI as the office host.

use cb_client::models::{ConstituentPayload, LegacyConstituent};
use cb_client::{
    ApiError, Credentials, InMemoryCredentialStore, LegacyApiClient, LegacyClientConfig,
    RateLimiters,
};
use cb_common::{EntityType, ExternalId, OfficeId};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> LegacyClientConfig {
    LegacyClientConfig {
        // Keep retries fast so the 429 test does not sleep for seconds
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        max_retries: 3,
        ..LegacyClientConfig::default()
    }
}

fn build_client(server_uri: &str, config: LegacyClientConfig) -> (LegacyApiClient, OfficeId) {
    let office_id = OfficeId::new();
    let store = InMemoryCredentialStore::new();
    store.insert(Credentials {
        office_id,
        api_host: server_uri.to_string(),
        email: "sync@office.example.org".to_string(),
        password: "hunter2".to_string(),
        cached_token: None,
        token_expires_at: None,
    });

    let client = LegacyApiClient::new(config, Arc::new(store), RateLimiters::global(100.0))
        .expect("client should build");
    (client, office_id)
}

#[tokio::test]
async fn authenticate_caches_token_across_calls() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("session-token-abc"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let first = client.authenticate(office_id).await.unwrap();
    let second = client.authenticate(office_id).await.unwrap();

    assert_eq!(first, "session-token-abc");
    assert_eq!(second, "session-token-abc");
    // expect(1) on the mock verifies only one auth request went out
}

#[tokio::test]
async fn persisted_token_is_reused_without_auth_call() {
    let server = MockServer::start().await;

    // No auth mock mounted: any auth attempt would 404 and fail the call
    Mock::given(method("GET"))
        .and(path("/api/ajax/constituents/42"))
        .and(header("Authorization", "stored-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 42,
            "firstName": "Ada",
            "lastName": "Lovelace"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let office_id = OfficeId::new();
    let store = InMemoryCredentialStore::new();
    store.insert(Credentials {
        office_id,
        api_host: server.uri(),
        email: "sync@office.example.org".to_string(),
        password: "hunter2".to_string(),
        cached_token: Some("stored-token".to_string()),
        token_expires_at: Some(Utc::now() + ChronoDuration::minutes(20)),
    });

    let client = LegacyApiClient::new(
        test_config(),
        Arc::new(store),
        RateLimiters::global(100.0),
    )
    .unwrap();

    let constituent = client
        .get_constituent(office_id, ExternalId::from_trusted(42).unwrap())
        .await
        .unwrap();

    assert!(constituent.is_some());
}

#[tokio::test]
async fn missing_record_maps_to_none() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/ajax/constituents/999"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let result: Option<LegacyConstituent> = client
        .get_constituent(office_id, ExternalId::from_trusted(999).unwrap())
        .await
        .unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn rate_limited_response_is_retried_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(&server)
        .await;

    // First hit is throttled by the legacy side, second goes through
    Mock::given(method("GET"))
        .and(path("/api/ajax/caseworkers/all"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/ajax/caseworkers/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 1, "name": "Grace Hopper", "email": "g@office.example.org"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let workers = client.list_caseworkers(office_id).await.unwrap();
    assert_eq!(workers.len(), 1);
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents"))
        .respond_with(ResponseTemplate::new(422).set_body_string("email already in use"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let payload = ConstituentPayload {
        first_name: Some("Ada".to_string()),
        last_name: Some("Lovelace".to_string()),
        ..ConstituentPayload::default()
    };
    let error = client
        .create_constituent(office_id, &payload)
        .await
        .unwrap_err();

    match error {
        ApiError::Validation { status, body } => {
            assert_eq!(status, 422);
            assert!(body.contains("already in use"));
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[tokio::test]
async fn disabled_client_sends_nothing() {
    let server = MockServer::start().await;

    // Zero requests of any kind may reach the server
    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .expect(0)
        .mount(&server)
        .await;

    let config = LegacyClientConfig {
        disabled: true,
        ..test_config()
    };
    let (client, office_id) = build_client(&server.uri(), config);

    let error = client.list_caseworkers(office_id).await.unwrap_err();
    assert!(matches!(error, ApiError::Disabled));
}

#[tokio::test]
async fn rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .expect(2)
        .mount(&server)
        .await;

    // Legacy side killed the session early: first call bounces
    Mock::given(method("GET"))
        .and(path("/api/ajax/casetype"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/ajax/casetype"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 3, "name": "Housing"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let types = client.list_case_types(office_id).await.unwrap();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].name.as_deref(), Some("Housing"));
}

#[tokio::test]
async fn search_sends_page_and_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/constituents/search"))
        .and(body_json(serde_json::json!({
            "page": 2,
            "updatedSince": "2026-08-01T00:00:00Z"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [{"id": 7, "firstName": "Joan"}],
            "page": 2,
            "totalPages": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let page = client
        .search(
            office_id,
            EntityType::Constituents,
            2,
            Some("2026-08-01T00:00:00Z"),
        )
        .await
        .unwrap();

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.total_pages, 3);
    assert!(page.has_more());
}

#[tokio::test]
async fn reference_list_wraps_into_single_page() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/ajax/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/ajax/statustype"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 1, "name": "Open"},
            {"id": 2, "name": "Closed"}
        ])))
        .mount(&server)
        .await;

    let (client, office_id) = build_client(&server.uri(), test_config());

    let page = client
        .search(office_id, EntityType::StatusTypes, 1, None)
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.page, 1);
    assert!(!page.has_more());
}
