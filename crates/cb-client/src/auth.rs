//! Per-office credentials and session-token lifecycle.
//!
//! Tokens are cached per office and refreshed behind a per-office mutex so
//! two concurrent calls for the same expiring office trigger exactly one
//! re-authentication. Distinct offices never contend.

use async_trait::async_trait;
use cb_common::OfficeId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ApiError;

/// Legacy credentials for one office.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub office_id: OfficeId,
    /// Bare subdomain or full custom domain for the office's legacy instance
    pub api_host: String,
    pub email: String,
    pub password: String,
    /// Last persisted token, loaded so a process restart can reuse a live
    /// session instead of re-authenticating every office at once
    pub cached_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// External persistence collaborator for credentials and cached tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, office_id: OfficeId) -> Result<Credentials, ApiError>;

    async fn save_token(
        &self,
        office_id: OfficeId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError>;

    async fn invalidate_token(&self, office_id: OfficeId) -> Result<(), ApiError>;
}

/// In-memory credential store for tests and development.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    entries: DashMap<OfficeId, Credentials>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credentials: Credentials) {
        self.entries.insert(credentials.office_id, credentials);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, office_id: OfficeId) -> Result<Credentials, ApiError> {
        self.entries
            .get(&office_id)
            .map(|c| c.clone())
            .ok_or_else(|| ApiError::Credentials(office_id.to_string()))
    }

    async fn save_token(
        &self,
        office_id: OfficeId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        if let Some(mut entry) = self.entries.get_mut(&office_id) {
            entry.cached_token = Some(token.to_string());
            entry.token_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn invalidate_token(&self, office_id: OfficeId) -> Result<(), ApiError> {
        if let Some(mut entry) = self.entries.get_mut(&office_id) {
            entry.cached_token = None;
            entry.token_expires_at = None;
        }
        Ok(())
    }
}

/// Cached session token for one office.
#[derive(Debug, Default, Clone)]
pub struct TokenSlot {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the slot has been primed from the credential store
    pub loaded: bool,
}

impl TokenSlot {
    /// The cached token is usable only while its expiry is more than the
    /// refresh margin away.
    pub fn valid_token(&self, margin: ChronoDuration) -> Option<&str> {
        match (&self.token, self.expires_at) {
            (Some(token), Some(expires_at)) if expires_at > Utc::now() + margin => {
                Some(token.as_str())
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.token = None;
        self.expires_at = None;
    }
}

/// Per-office token cache. Owned by the client instance; no ambient shared
/// state.
#[derive(Default)]
pub struct TokenCache {
    slots: DashMap<OfficeId, Arc<Mutex<TokenSlot>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-office slot; holding its mutex serializes refresh-on-expiry
    /// for that office (single-flight).
    pub fn slot(&self, office_id: OfficeId) -> Arc<Mutex<TokenSlot>> {
        self.slots
            .entry(office_id)
            .or_insert_with(|| Arc::new(Mutex::new(TokenSlot::default())))
            .clone()
    }

    /// Drop the cached token so the next call re-authenticates.
    pub async fn evict(&self, office_id: OfficeId) {
        let slot = match self.slots.get(&office_id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        slot.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with_expiry(seconds_from_now: i64) -> TokenSlot {
        TokenSlot {
            token: Some("tok".to_string()),
            expires_at: Some(Utc::now() + ChronoDuration::seconds(seconds_from_now)),
            loaded: true,
        }
    }

    #[test]
    fn token_inside_margin_is_stale() {
        let margin = ChronoDuration::minutes(5);
        // 4m59s away: must re-authenticate
        assert!(slot_with_expiry(4 * 60 + 59).valid_token(margin).is_none());
        // 5m01s away: still usable
        assert!(slot_with_expiry(5 * 60 + 1).valid_token(margin).is_some());
    }

    #[test]
    fn missing_token_is_invalid() {
        let slot = TokenSlot::default();
        assert!(slot.valid_token(ChronoDuration::minutes(5)).is_none());
    }

    #[tokio::test]
    async fn cache_returns_same_slot_per_office() {
        let cache = TokenCache::new();
        let office = OfficeId::new();
        let a = cache.slot(office);
        let b = cache.slot(office);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn evict_clears_token() {
        let cache = TokenCache::new();
        let office = OfficeId::new();
        {
            let slot = cache.slot(office);
            let mut guard = slot.lock().await;
            *guard = slot_with_expiry(3600);
        }
        cache.evict(office).await;
        let slot = cache.slot(office);
        assert!(slot.lock().await.token.is_none());
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryCredentialStore::new();
        let office = OfficeId::new();
        store.insert(Credentials {
            office_id: office,
            api_host: "office1".to_string(),
            email: "sync@example.org".to_string(),
            password: "secret".to_string(),
            cached_token: None,
            token_expires_at: None,
        });

        let expires = Utc::now() + ChronoDuration::minutes(25);
        store.save_token(office, "tok-1", expires).await.unwrap();
        let creds = store.load(office).await.unwrap();
        assert_eq!(creds.cached_token.as_deref(), Some("tok-1"));

        store.invalidate_token(office).await.unwrap();
        let creds = store.load(office).await.unwrap();
        assert!(creds.cached_token.is_none());
    }

    #[tokio::test]
    async fn unknown_office_is_a_credentials_error() {
        let store = InMemoryCredentialStore::new();
        assert!(matches!(
            store.load(OfficeId::new()).await,
            Err(ApiError::Credentials(_))
        ));
    }
}
