//! SQLite-backed credential store.
//!
//! One row per office, seeded by operators; cached session tokens are
//! persisted so a restart can reuse a live legacy session. Doubles as the
//! office directory for the scheduler: every active credential row is an
//! office to keep in sync.

use cb_client::{ApiError, CredentialStore, Credentials};
use cb_common::OfficeId;
use cb_engine::{EngineError, OfficeDirectory};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS office_credentials (
                office_id TEXT PRIMARY KEY,
                api_host TEXT NOT NULL,
                email TEXT NOT NULL,
                password TEXT NOT NULL,
                cached_token TEXT,
                token_expires_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn db_err(office_id: OfficeId, e: sqlx::Error) -> ApiError {
    ApiError::Credentials(format!("{office_id}: {e}"))
}

#[async_trait::async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, office_id: OfficeId) -> Result<Credentials, ApiError> {
        let row = sqlx::query(
            "SELECT api_host, email, password, cached_token, token_expires_at
             FROM office_credentials WHERE office_id = ? AND active = 1",
        )
        .bind(office_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err(office_id, e))?
        .ok_or_else(|| ApiError::Credentials(format!("no credentials for office {office_id}")))?;

        Ok(Credentials {
            office_id,
            api_host: row.get("api_host"),
            email: row.get("email"),
            password: row.get("password"),
            cached_token: row.get("cached_token"),
            token_expires_at: row.get::<Option<DateTime<Utc>>, _>("token_expires_at"),
        })
    }

    async fn save_token(
        &self,
        office_id: OfficeId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE office_credentials SET cached_token = ?, token_expires_at = ?
             WHERE office_id = ?",
        )
        .bind(token)
        .bind(expires_at)
        .bind(office_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(office_id, e))?;
        Ok(())
    }

    async fn invalidate_token(&self, office_id: OfficeId) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE office_credentials SET cached_token = NULL, token_expires_at = NULL
             WHERE office_id = ?",
        )
        .bind(office_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err(office_id, e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl OfficeDirectory for SqliteCredentialStore {
    async fn active_offices(&self) -> Result<Vec<OfficeId>, EngineError> {
        let rows = sqlx::query("SELECT office_id FROM office_credentials WHERE active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(cb_store::StoreError::from)?;

        let mut offices = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("office_id");
            let id = Uuid::parse_str(&raw)
                .map_err(|e| EngineError::Payload(format!("bad office id {raw}: {e}")))?;
            offices.push(OfficeId(id));
        }
        Ok(offices)
    }
}
