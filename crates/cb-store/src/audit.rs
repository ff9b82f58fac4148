//! Append-only audit trail of mutation attempts.
//!
//! Rows are written once and never updated or deleted; the store exposes no
//! mutation beyond `append`.

use cb_common::{AuditLogEntry, AuditOperation, EntityType, ExternalId, OfficeId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{QuerySpec, Result, StoreError};

#[derive(Clone)]
pub struct AuditLogStore {
    pool: SqlitePool,
}

impl AuditLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        let old_data = entry
            .old_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new_data = entry
            .new_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_audit_log
                (id, office_id, entity_type, operation, external_id,
                 internal_id, old_data, new_data, conflict_resolution,
                 error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.office_id.to_string())
        .bind(entry.entity_type.as_str())
        .bind(entry.operation.as_str())
        .bind(entry.external_id.map(|id| id.as_i64()))
        .bind(entry.internal_id.map(|id| id.to_string()))
        .bind(old_data)
        .bind(new_data)
        .bind(&entry.conflict_resolution)
        .bind(&entry.error_message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list(&self, spec: &QuerySpec) -> Result<Vec<AuditLogEntry>> {
        let mut sql = String::from("SELECT * FROM sync_audit_log WHERE office_id = ?");
        if spec.entity_type.is_some() {
            sql.push_str(" AND entity_type = ?");
        }
        if spec.external_id.is_some() {
            sql.push_str(" AND external_id = ?");
        }
        if spec.updated_since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(&format!(" ORDER BY created_at {}", spec.order.sql()));
        if spec.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(spec.office_id.to_string());
        if let Some(entity_type) = spec.entity_type {
            query = query.bind(entity_type.as_str());
        }
        if let Some(external_id) = spec.external_id {
            query = query.bind(external_id.as_i64());
        }
        if let Some(since) = spec.updated_since {
            query = query.bind(since);
        }
        if let Some(limit) = spec.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(parse_row).collect()
    }

    /// Count of conflict entries for an office, used to surface unreconciled
    /// divergence between the shadow store and the legacy system.
    pub async fn count_conflicts(&self, office_id: OfficeId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sync_audit_log
             WHERE office_id = ? AND operation = 'conflict'",
        )
        .bind(office_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("n")?)
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditLogEntry> {
    let decode = |msg: String| StoreError::Database(sqlx::Error::Decode(msg.into()));

    let office_raw: String = row.try_get("office_id")?;
    let office_id = Uuid::parse_str(&office_raw)
        .map(OfficeId)
        .map_err(|e| decode(e.to_string()))?;

    let entity_raw: String = row.try_get("entity_type")?;
    let entity_type = EntityType::parse(&entity_raw)
        .ok_or_else(|| decode(format!("unknown entity type: {entity_raw}")))?;

    let op_raw: String = row.try_get("operation")?;
    let operation = AuditOperation::parse(&op_raw)
        .ok_or_else(|| decode(format!("unknown audit operation: {op_raw}")))?;

    let external_id = row
        .try_get::<Option<i64>, _>("external_id")?
        .and_then(ExternalId::from_trusted);

    let internal_id = row
        .try_get::<Option<String>, _>("internal_id")?
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|e| decode(e.to_string()))?;

    let old_data = row
        .try_get::<Option<String>, _>("old_data")?
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    let new_data = row
        .try_get::<Option<String>, _>("new_data")?
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(AuditLogEntry {
        office_id,
        entity_type,
        operation,
        external_id,
        internal_id,
        old_data,
        new_data,
        conflict_resolution: row.try_get("conflict_resolution")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
