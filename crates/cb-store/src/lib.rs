//! Shadow store: the local mirror of legacy records.
//!
//! SQLite-backed repositories for sync status, the audit trail, and the
//! per-entity shadow tables. The shadow database is the single source of
//! truth for "have we seen this external record": handlers upsert by
//! `(office_id, external_id)` and never rely on in-memory state across job
//! invocations.

use sqlx::SqlitePool;

pub mod audit;
pub mod query;
pub mod shadow;
pub mod sync_status;

pub use audit::AuditLogStore;
pub use query::{QuerySpec, SortOrder};
pub use shadow::{ReferenceRepo, ShadowRecord, ShadowRepo};
pub use sync_status::{SyncOutcome, SyncStatusStore, CANCELLED_BY_USER};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A concurrent operation already holds the row this one needed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Create all tables if they do not exist. Timestamps are RFC 3339 text,
/// identifiers are uuid text, record bodies are JSON text.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_status (
            id TEXT PRIMARY KEY,
            office_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            last_sync_started_at TEXT,
            last_sync_completed_at TEXT,
            last_sync_success INTEGER,
            last_sync_error TEXT,
            cursor TEXT,
            records_synced INTEGER NOT NULL DEFAULT 0,
            records_failed INTEGER NOT NULL DEFAULT 0,
            UNIQUE(office_id, entity_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_audit_log (
            id TEXT PRIMARY KEY,
            office_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            operation TEXT NOT NULL,
            external_id INTEGER,
            internal_id TEXT,
            old_data TEXT,
            new_data TEXT,
            conflict_resolution TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_office_op
         ON sync_audit_log (office_id, operation)",
    )
    .execute(pool)
    .await?;

    for table in shadow::DOMAIN_TABLES {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                office_id TEXT NOT NULL,
                external_id INTEGER,
                data TEXT NOT NULL,
                last_synced_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(office_id, external_id)
            )
            "#
        );
        sqlx::query(&ddl).execute(pool).await?;
    }

    // Reference rows of all kinds share one table, so the entity type joins
    // the uniqueness key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reference_records (
            id TEXT PRIMARY KEY,
            office_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            external_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            last_synced_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(office_id, entity_type, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
