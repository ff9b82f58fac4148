//! Sync status rows: one per (office, entity type).
//!
//! `begin_sync` is the overlap guard for the whole engine. It claims the row
//! in a single statement so no window exists between "check nothing is
//! running" and "mark as running", even across processes sharing the
//! database.

use cb_common::{EntityType, OfficeId, SyncStatus};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Result, StoreError};

/// Error message recorded by a user-initiated cancellation. The pull loop
/// checks for this exact value between pages.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Final tallies for a sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub cursor: Option<String>,
    pub records_synced: i64,
    pub records_failed: i64,
}

#[derive(Clone)]
pub struct SyncStatusStore {
    pool: SqlitePool,
}

impl SyncStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim the (office, entity) slot for a new sync run.
    ///
    /// Inserts the row if it never existed, or flips an idle row back to
    /// in-progress. The conditional update refuses to touch a row whose
    /// previous run has started but not completed; zero affected rows means
    /// another sync holds the slot and the caller gets `Conflict`.
    pub async fn begin_sync(&self, office_id: OfficeId, entity_type: EntityType) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_status
                (id, office_id, entity_type, last_sync_started_at,
                 last_sync_completed_at, last_sync_success, last_sync_error,
                 cursor, records_synced, records_failed)
            VALUES (?, ?, ?, ?, NULL, NULL, NULL, NULL, 0, 0)
            ON CONFLICT(office_id, entity_type) DO UPDATE SET
                last_sync_started_at = excluded.last_sync_started_at,
                last_sync_completed_at = NULL,
                last_sync_success = NULL,
                last_sync_error = NULL
            WHERE sync_status.last_sync_completed_at IS NOT NULL
               OR sync_status.last_sync_started_at IS NULL
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "sync already in progress for office {office_id} entity {entity_type}"
            )));
        }

        debug!(office_id = %office_id, entity_type = %entity_type, "Sync slot claimed");
        Ok(())
    }

    /// Record the run's outcome and release the slot. The cursor is only
    /// advanced when the run produced one; a failed run keeps the previous
    /// cursor so the next attempt resumes from the same point.
    pub async fn complete_sync(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        outcome: &SyncOutcome,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_status SET
                last_sync_completed_at = ?,
                last_sync_success = ?,
                last_sync_error = ?,
                cursor = COALESCE(?, cursor),
                records_synced = ?,
                records_failed = ?
            WHERE office_id = ? AND entity_type = ?
            "#,
        )
        .bind(Utc::now())
        .bind(outcome.success)
        .bind(&outcome.error)
        .bind(&outcome.cursor)
        .bind(outcome.records_synced)
        .bind(outcome.records_failed)
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no sync status row for office {office_id} entity {entity_type}"
            )));
        }

        info!(
            office_id = %office_id,
            entity_type = %entity_type,
            success = outcome.success,
            records_synced = outcome.records_synced,
            records_failed = outcome.records_failed,
            "Sync completed"
        );
        Ok(())
    }

    /// User-initiated stop. Marks the in-progress run cancelled; the pull
    /// loop observes this between pages via `is_cancelled` and stops without
    /// writing a competing outcome.
    pub async fn cancel_sync(&self, office_id: OfficeId, entity_type: EntityType) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_status SET
                last_sync_completed_at = ?,
                last_sync_success = 0,
                last_sync_error = ?
            WHERE office_id = ? AND entity_type = ?
              AND last_sync_started_at IS NOT NULL
              AND last_sync_completed_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(CANCELLED_BY_USER)
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no in-progress sync for office {office_id} entity {entity_type}"
            )));
        }

        info!(office_id = %office_id, entity_type = %entity_type, "Sync cancelled");
        Ok(())
    }

    pub async fn is_cancelled(&self, office_id: OfficeId, entity_type: EntityType) -> Result<bool> {
        let row = sqlx::query(
            "SELECT last_sync_error FROM sync_status
             WHERE office_id = ? AND entity_type = ?",
        )
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let cancelled = row
            .and_then(|r| r.get::<Option<String>, _>("last_sync_error"))
            .is_some_and(|e| e == CANCELLED_BY_USER);
        Ok(cancelled)
    }

    pub async fn get(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
    ) -> Result<Option<SyncStatus>> {
        let row = sqlx::query(
            "SELECT * FROM sync_status WHERE office_id = ? AND entity_type = ?",
        )
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| parse_row(&r)).transpose()
    }

    pub async fn list_for_office(&self, office_id: OfficeId) -> Result<Vec<SyncStatus>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_status WHERE office_id = ? ORDER BY entity_type ASC",
        )
        .bind(office_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_row).collect()
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<SyncStatus> {
    let office_raw: String = row.try_get("office_id")?;
    let office_id = Uuid::parse_str(&office_raw)
        .map(OfficeId)
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?;

    let entity_raw: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("unknown entity type: {entity_raw}").into(),
        ))
    })?;

    Ok(SyncStatus {
        office_id,
        entity_type,
        last_sync_started_at: row.try_get::<Option<DateTime<Utc>>, _>("last_sync_started_at")?,
        last_sync_completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("last_sync_completed_at")?,
        last_sync_success: row.try_get("last_sync_success")?,
        last_sync_error: row.try_get("last_sync_error")?,
        cursor: row.try_get("cursor")?,
        records_synced: row.try_get("records_synced")?,
        records_failed: row.try_get("records_failed")?,
    })
}
