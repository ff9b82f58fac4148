//! Legacy case-management API client.
//!
//! The sole network boundary to the legacy system. Every operation is
//! office-scoped, funnels through the shared rate limiter and backoff policy,
//! and refuses to execute when the safety valve is set. 404 on a by-id GET is
//! mapped to `None` so callers use the normal "not found" branch instead of
//! error handling.

use cb_common::{EntityType, ExternalId, OfficeId};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod auth;
pub mod backoff;
pub mod error;
pub mod models;
pub mod rate_limit;

pub use auth::{CredentialStore, Credentials, InMemoryCredentialStore, TokenCache};
pub use backoff::BackoffPolicy;
pub use error::ApiError;
pub use rate_limit::{RateLimiter, RateLimiters};

use models::*;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Client configuration. The binary maps `cb-config` values into this.
#[derive(Debug, Clone)]
pub struct LegacyClientConfig {
    /// Vendor domain appended to bare office subdomains
    pub vendor_domain: String,
    pub auth_locale: String,
    /// Assumed server-side session lifetime (not reported by the auth
    /// response, so configurable rather than hardcoded)
    pub token_lifetime: ChronoDuration,
    /// A cached token is reused only while its expiry is further away than
    /// this margin; the stored expiry is lifetime minus margin
    pub token_refresh_margin: ChronoDuration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Safety valve: fail every outbound call fast instead of executing
    pub disabled: bool,
}

impl Default for LegacyClientConfig {
    fn default() -> Self {
        Self {
            vendor_domain: "casemanager.example.net".to_string(),
            auth_locale: "en-GB".to_string(),
            token_lifetime: ChronoDuration::minutes(30),
            token_refresh_margin: ChronoDuration::minutes(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30000),
            disabled: false,
        }
    }
}

pub struct LegacyApiClient {
    http: reqwest::Client,
    config: LegacyClientConfig,
    credentials: Arc<dyn CredentialStore>,
    tokens: TokenCache,
    limiters: RateLimiters,
    backoff: BackoffPolicy,
    disabled: AtomicBool,
}

impl LegacyApiClient {
    pub fn new(
        config: LegacyClientConfig,
        credentials: Arc<dyn CredentialStore>,
        limiters: RateLimiters,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let backoff = BackoffPolicy::new(config.backoff_base, config.backoff_max, config.max_retries);
        let disabled = AtomicBool::new(config.disabled);

        Ok(Self {
            http,
            config,
            credentials,
            tokens: TokenCache::new(),
            limiters,
            backoff,
            disabled,
        })
    }

    /// Flip the safety valve at runtime (incident response).
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
        warn!(disabled = disabled, "Legacy API safety valve changed");
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Build the office's API base URL.
    ///
    /// All per-tenant routing differences are isolated here: trailing slashes
    /// are stripped, a bare subdomain is qualified with the vendor domain,
    /// and hosts without a scheme get https. An explicit `http://` is kept
    /// for local development endpoints.
    fn base_url(&self, api_host: &str) -> String {
        let trimmed = api_host.trim().trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return format!("{trimmed}/api/ajax");
        }
        if trimmed.contains('.') {
            format!("https://{trimmed}/api/ajax")
        } else {
            format!("https://{trimmed}.{}/api/ajax", self.config.vendor_domain)
        }
    }

    // ========================================================================
    // Authentication & token lifecycle
    // ========================================================================

    /// Return a valid session token for the office, re-authenticating only
    /// when the cached token is within the refresh margin of its expiry.
    ///
    /// The per-office slot mutex is held across the whole check-and-refresh,
    /// so concurrent calls for one expiring office produce a single auth
    /// request (single-flight).
    pub async fn authenticate(&self, office_id: OfficeId) -> Result<String> {
        let slot = self.tokens.slot(office_id);
        let mut guard = slot.lock().await;

        if !guard.loaded {
            // Prime from persisted state so a restart can reuse a live session
            let creds = self.credentials.load(office_id).await?;
            guard.token = creds.cached_token;
            guard.expires_at = creds.token_expires_at;
            guard.loaded = true;
        }

        if let Some(token) = guard.valid_token(self.config.token_refresh_margin) {
            return Ok(token.to_string());
        }

        let creds = self.credentials.load(office_id).await?;
        let token = self.fetch_token(&creds).await?;
        let expires_at =
            Utc::now() + (self.config.token_lifetime - self.config.token_refresh_margin);

        guard.token = Some(token.clone());
        guard.expires_at = Some(expires_at);
        self.credentials
            .save_token(office_id, &token, expires_at)
            .await?;

        info!(office_id = %office_id, expires_at = %expires_at, "Authenticated with legacy API");
        Ok(token)
    }

    /// Force cache eviction then re-authenticate.
    pub async fn refresh_token(&self, office_id: OfficeId) -> Result<String> {
        self.tokens.evict(office_id).await;
        self.credentials.invalidate_token(office_id).await?;
        self.authenticate(office_id).await
    }

    /// `POST /auth` with the office credentials; the response body is the
    /// literal bearer string.
    async fn fetch_token(&self, creds: &Credentials) -> Result<String> {
        let url = format!("{}/auth", self.base_url(&creds.api_host));
        let body = AuthRequest {
            email: &creds.email,
            password: &creds.password,
            locale: &self.config.auth_locale,
        };
        let body = serde_json::to_value(&body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        let response = self
            .execute_raw(creds.office_id, Method::POST, &url, None, Some(&body))
            .await?;

        let status = response.status();
        if status.is_success() {
            let token = response.text().await?;
            if token.trim().is_empty() {
                return Err(ApiError::InvalidResponse("empty auth token".to_string()));
            }
            Ok(token.trim().to_string())
        } else if status == StatusCode::UNAUTHORIZED {
            Err(ApiError::Authentication(format!(
                "invalid credentials for office {}",
                creds.office_id
            )))
        } else {
            Err(Self::classify_failure(status, response.text().await.unwrap_or_default()))
        }
    }

    // ========================================================================
    // Request core
    // ========================================================================

    fn classify_failure(status: StatusCode, body: String) -> ApiError {
        match status.as_u16() {
            401 => ApiError::Authentication(body),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::Validation {
                status: status.as_u16(),
                body,
            },
            _ => ApiError::Server {
                status: status.as_u16(),
                body,
            },
        }
    }

    /// Every outbound call flows through here: safety valve, then the shared
    /// rate limiter, then the backoff policy around the actual fetch. The
    /// retry predicate matches the error taxonomy: only 429 and transport
    /// failures are retried.
    async fn execute_raw(
        &self,
        office_id: OfficeId,
        method: Method,
        url: &str,
        token: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        // Fail closed before any socket use
        if self.is_disabled() {
            return Err(ApiError::Disabled);
        }

        let limiter = self.limiters.for_office(office_id);
        limiter
            .execute(|| {
                self.backoff.execute(
                    || async {
                        let mut request = self.http.request(method.clone(), url);
                        if let Some(token) = token {
                            // The legacy API expects the literal token, not a
                            // "Bearer " prefix
                            request = request.header("Authorization", token);
                        }
                        if let Some(body) = body {
                            request = request.json(body);
                        }

                        let response = request.send().await?;
                        if response.status() == StatusCode::TOO_MANY_REQUESTS {
                            return Err(ApiError::RateLimited);
                        }
                        Ok(response)
                    },
                    |error: &ApiError, _attempt| error.is_retryable(),
                )
            })
            .await
    }

    /// Authenticated request with response interpretation. A 401 invalidates
    /// the cached token, forces one refresh and a single re-attempt, then
    /// surfaces. 404 is `Ok(None)` only when `allow_not_found` is set (by-id
    /// GETs); everywhere else it is a validation error.
    async fn request(
        &self,
        office_id: OfficeId,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        allow_not_found: bool,
    ) -> Result<Option<serde_json::Value>> {
        let creds = self.credentials.load(office_id).await?;
        let url = format!("{}{}", self.base_url(&creds.api_host), path);

        let mut refreshed = false;
        loop {
            let token = self.authenticate(office_id).await?;
            let response = self
                .execute_raw(office_id, method.clone(), &url, Some(&token), body)
                .await?;

            let status = response.status();
            if status.is_success() {
                if status == StatusCode::NO_CONTENT {
                    return Ok(None);
                }
                let value = response
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
                return Ok(Some(value));
            }

            if status == StatusCode::NOT_FOUND && allow_not_found {
                debug!(office_id = %office_id, path = %path, "Legacy record not found");
                return Ok(None);
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(office_id = %office_id, "Token rejected, refreshing and retrying once");
                self.tokens.evict(office_id).await;
                self.credentials.invalidate_token(office_id).await?;
                refreshed = true;
                continue;
            }

            return Err(Self::classify_failure(
                status,
                response.text().await.unwrap_or_default(),
            ));
        }
    }

    fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// GET that treats 404 as an error (list endpoints).
    pub async fn get<T: DeserializeOwned>(&self, office_id: OfficeId, path: &str) -> Result<T> {
        let value = self
            .request(office_id, Method::GET, path, None, false)
            .await?
            .ok_or_else(|| ApiError::InvalidResponse("empty response body".to_string()))?;
        Self::decode(value)
    }

    /// GET-by-id: 404 is a normal value.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        office_id: OfficeId,
        path: &str,
    ) -> Result<Option<T>> {
        match self
            .request(office_id, Method::GET, path, None, true)
            .await?
        {
            Some(value) => Ok(Some(Self::decode(value)?)),
            None => Ok(None),
        }
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        office_id: OfficeId,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let value = self
            .request(office_id, Method::POST, path, Some(&body), false)
            .await?
            .ok_or_else(|| ApiError::InvalidResponse("empty response body".to_string()))?;
        Self::decode(value)
    }

    /// POST where the response body (if any) is ignored.
    pub async fn post_unit<B: Serialize>(
        &self,
        office_id: OfficeId,
        path: &str,
        body: &B,
    ) -> Result<()> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        self.request(office_id, Method::POST, path, Some(&body), false)
            .await?;
        Ok(())
    }

    pub async fn patch<B: Serialize>(
        &self,
        office_id: OfficeId,
        path: &str,
        body: &B,
    ) -> Result<()> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        self.request(office_id, Method::PATCH, path, Some(&body), false)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Domain operations
    // ========================================================================

    /// Paginated pull for any syncable entity type. Domain entities come from
    /// their search endpoints; reference endpoints return flat lists wrapped
    /// into a single page. Items stay as raw JSON so a single malformed
    /// record can be skipped without failing the batch.
    pub async fn search(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        page: u32,
        updated_since: Option<&str>,
    ) -> Result<SearchPage<serde_json::Value>> {
        let path = match entity_type {
            EntityType::Constituents => "/constituents/search",
            EntityType::Cases => "/cases/search",
            EntityType::Emails => "/inbox/search",
            EntityType::Casenotes => "/casenotes/search",
            EntityType::Caseworkers => "/caseworkers/all",
            EntityType::CaseTypes => "/casetype",
            EntityType::StatusTypes => "/statustype",
            EntityType::CategoryTypes => "/categorytype",
            EntityType::ContactTypes => "/contacttype",
        };

        if entity_type.is_reference() {
            let items: Vec<serde_json::Value> = self.get(office_id, path).await?;
            return Ok(SearchPage {
                items,
                page: 1,
                total_pages: 1,
            });
        }

        let request = SearchRequest {
            page,
            updated_since,
        };
        self.post(office_id, path, &request).await
    }

    /// Create a legacy record of a pushable entity type from its raw JSON
    /// body, returning the id the legacy system assigned.
    pub async fn create_record(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        data: &serde_json::Value,
    ) -> Result<ExternalId> {
        let path = Self::push_path(entity_type)?;
        let created: CreatedRecord = self.post(office_id, path, data).await?;
        Ok(created.id)
    }

    pub async fn update_record(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        id: ExternalId,
        data: &serde_json::Value,
    ) -> Result<()> {
        let path = Self::push_path(entity_type)?;
        self.patch(office_id, &format!("{path}/{id}"), data).await
    }

    /// Entity types that accept local mutations. Emails and reference data
    /// only flow inbound.
    fn push_path(entity_type: EntityType) -> Result<&'static str> {
        match entity_type {
            EntityType::Constituents => Ok("/constituents"),
            EntityType::Cases => Ok("/cases"),
            EntityType::Casenotes => Ok("/casenotes"),
            other => Err(ApiError::Validation {
                status: 0,
                body: format!("entity type {other} cannot be pushed"),
            }),
        }
    }

    pub async fn get_constituent(
        &self,
        office_id: OfficeId,
        id: ExternalId,
    ) -> Result<Option<LegacyConstituent>> {
        self.get_optional(office_id, &format!("/constituents/{id}"))
            .await
    }

    pub async fn create_constituent(
        &self,
        office_id: OfficeId,
        payload: &ConstituentPayload,
    ) -> Result<ExternalId> {
        let created: CreatedRecord = self.post(office_id, "/constituents", payload).await?;
        Ok(created.id)
    }

    pub async fn update_constituent(
        &self,
        office_id: OfficeId,
        id: ExternalId,
        payload: &ConstituentPayload,
    ) -> Result<()> {
        self.patch(office_id, &format!("/constituents/{id}"), payload)
            .await
    }

    pub async fn get_case(
        &self,
        office_id: OfficeId,
        id: ExternalId,
    ) -> Result<Option<LegacyCase>> {
        self.get_optional(office_id, &format!("/cases/{id}")).await
    }

    pub async fn create_case(
        &self,
        office_id: OfficeId,
        payload: &CasePayload,
    ) -> Result<ExternalId> {
        let created: CreatedRecord = self.post(office_id, "/cases", payload).await?;
        Ok(created.id)
    }

    pub async fn update_case(
        &self,
        office_id: OfficeId,
        id: ExternalId,
        payload: &CasePayload,
    ) -> Result<()> {
        self.patch(office_id, &format!("/cases/{id}"), payload).await
    }

    pub async fn get_email(
        &self,
        office_id: OfficeId,
        id: ExternalId,
    ) -> Result<Option<LegacyEmail>> {
        self.get_optional(office_id, &format!("/emails/{id}")).await
    }

    /// Mark an inbound email as actioned so the legacy inbox stops reporting
    /// it as new.
    pub async fn mark_email_actioned(&self, office_id: OfficeId, id: ExternalId) -> Result<()> {
        self.post_unit(
            office_id,
            &format!("/emails/{id}/actioned"),
            &serde_json::json!({}),
        )
        .await
    }

    /// Candidate constituent owners for an inbound email.
    pub async fn constituent_matches(
        &self,
        office_id: OfficeId,
        email_id: ExternalId,
    ) -> Result<Vec<ConstituentMatch>> {
        self.get(
            office_id,
            &format!("/inbox/constituentMatches?emailId={email_id}"),
        )
        .await
    }

    pub async fn create_casenote(
        &self,
        office_id: OfficeId,
        payload: &CasenotePayload,
    ) -> Result<ExternalId> {
        let created: CreatedRecord = self.post(office_id, "/casenotes", payload).await?;
        Ok(created.id)
    }

    pub async fn list_caseworkers(&self, office_id: OfficeId) -> Result<Vec<LegacyCaseworker>> {
        self.get(office_id, "/caseworkers/all").await
    }

    pub async fn list_case_types(&self, office_id: OfficeId) -> Result<Vec<ReferenceItem>> {
        self.get(office_id, "/casetype").await
    }

    pub async fn list_status_types(&self, office_id: OfficeId) -> Result<Vec<ReferenceItem>> {
        self.get(office_id, "/statustype").await
    }

    pub async fn list_category_types(&self, office_id: OfficeId) -> Result<Vec<ReferenceItem>> {
        self.get(office_id, "/categorytype").await
    }

    pub async fn list_contact_types(&self, office_id: OfficeId) -> Result<Vec<ReferenceItem>> {
        self.get(office_id, "/contacttype").await
    }
}
