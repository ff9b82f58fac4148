//! Per-entity shadow tables mirroring legacy records.
//!
//! One repository type parameterized by table, so every domain entity gets
//! the same stable method-per-query interface. Record bodies stay as the
//! legacy JSON; the columns the engine reasons about (ids, sync timestamps)
//! are first-class.

use cb_common::{EntityType, ExternalId, OfficeId};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{QuerySpec, Result, StoreError};

/// Domain entity tables. Reference data lives in `reference_records`.
pub(crate) const DOMAIN_TABLES: [&str; 4] = ["constituents", "cases", "emails", "casenotes"];

/// One mirrored row. `external_id` is null for locally-created records that
/// have not yet been pushed upstream.
#[derive(Debug, Clone)]
pub struct ShadowRecord {
    pub internal_id: Uuid,
    pub office_id: OfficeId,
    pub external_id: Option<ExternalId>,
    pub data: serde_json::Value,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ShadowRepo {
    pool: SqlitePool,
    table: &'static str,
}

impl ShadowRepo {
    fn new(pool: SqlitePool, table: &'static str) -> Self {
        Self { pool, table }
    }

    pub fn constituents(pool: SqlitePool) -> Self {
        Self::new(pool, "constituents")
    }

    pub fn cases(pool: SqlitePool) -> Self {
        Self::new(pool, "cases")
    }

    pub fn emails(pool: SqlitePool) -> Self {
        Self::new(pool, "emails")
    }

    pub fn casenotes(pool: SqlitePool) -> Self {
        Self::new(pool, "casenotes")
    }

    /// Repository for a domain entity type; `None` for reference types,
    /// which live in [`ReferenceRepo`].
    pub fn for_entity(pool: SqlitePool, entity_type: EntityType) -> Option<Self> {
        match entity_type {
            EntityType::Constituents => Some(Self::constituents(pool)),
            EntityType::Cases => Some(Self::cases(pool)),
            EntityType::Emails => Some(Self::emails(pool)),
            EntityType::Casenotes => Some(Self::casenotes(pool)),
            _ => None,
        }
    }

    /// Insert-or-update keyed on `(office_id, external_id)`. Re-running the
    /// same sync page lands on the same row; the body and `last_synced_at`
    /// are refreshed either way. Returns the row's internal id.
    pub async fn upsert(
        &self,
        office_id: OfficeId,
        external_id: ExternalId,
        data: &serde_json::Value,
    ) -> Result<Uuid> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, office_id, external_id, data, last_synced_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(office_id, external_id) DO UPDATE SET
                data = excluded.data,
                last_synced_at = excluded.last_synced_at
            RETURNING id
            "#,
            self.table
        );

        let now = Utc::now();
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(office_id.to_string())
            .bind(external_id.as_i64())
            .bind(serde_json::to_string(data)?)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        let id_raw: String = row.try_get("id")?;
        Uuid::parse_str(&id_raw)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))
    }

    /// Create a locally-originated row with no external id yet. The push
    /// handler assigns one via [`Self::update_external_id`] once the legacy
    /// system acknowledges the create.
    pub async fn create_local(
        &self,
        office_id: OfficeId,
        data: &serde_json::Value,
    ) -> Result<Uuid> {
        let sql = format!(
            "INSERT INTO {} (id, office_id, external_id, data, last_synced_at, created_at)
             VALUES (?, ?, NULL, ?, ?, ?)",
            self.table
        );

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(office_id.to_string())
            .bind(serde_json::to_string(data)?)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    pub async fn find_by_external_id(
        &self,
        office_id: OfficeId,
        external_id: ExternalId,
    ) -> Result<Option<ShadowRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE office_id = ? AND external_id = ?",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(office_id.to_string())
            .bind(external_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| parse_row(&r)).transpose()
    }

    pub async fn get(&self, internal_id: Uuid) -> Result<Option<ShadowRecord>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", self.table);
        let row = sqlx::query(&sql)
            .bind(internal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| parse_row(&r)).transpose()
    }

    /// Record the legacy-assigned id for a locally-created row.
    pub async fn update_external_id(
        &self,
        internal_id: Uuid,
        external_id: ExternalId,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET external_id = ?, last_synced_at = ? WHERE id = ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(external_id.as_i64())
            .bind(Utc::now())
            .bind(internal_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no {} row with id {internal_id}",
                self.table
            )));
        }
        Ok(())
    }

    pub async fn list(&self, spec: &QuerySpec) -> Result<Vec<ShadowRecord>> {
        let mut sql = format!("SELECT * FROM {} WHERE office_id = ?", self.table);
        if spec.external_id.is_some() {
            sql.push_str(" AND external_id = ?");
        }
        if spec.updated_since.is_some() {
            sql.push_str(" AND last_synced_at >= ?");
        }
        sql.push_str(&format!(" ORDER BY last_synced_at {}", spec.order.sql()));
        if spec.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(spec.office_id.to_string());
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
}

/// Reference data (caseworkers, case/status/category/contact types). All
/// kinds share one table with the entity type in the uniqueness key, and
/// unlike domain entities they are pruned when the legacy system stops
/// reporting them.
#[derive(Clone)]
pub struct ReferenceRepo {
    pool: SqlitePool,
}

impl ReferenceRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        external_id: ExternalId,
        data: &serde_json::Value,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO reference_records
                (id, office_id, entity_type, external_id, data, last_synced_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(office_id, entity_type, external_id) DO UPDATE SET
                data = excluded.data,
                last_synced_at = excluded.last_synced_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .bind(external_id.as_i64())
        .bind(serde_json::to_string(data)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let id_raw: String = row.try_get("id")?;
        Uuid::parse_str(&id_raw)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))
    }

    pub async fn find_by_external_id(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        external_id: ExternalId,
    ) -> Result<Option<ShadowRecord>> {
        let row = sqlx::query(
            "SELECT * FROM reference_records
             WHERE office_id = ? AND entity_type = ? AND external_id = ?",
        )
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .bind(external_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| parse_row(&r)).transpose()
    }

    pub async fn list(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
    ) -> Result<Vec<ShadowRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM reference_records
             WHERE office_id = ? AND entity_type = ?
             ORDER BY external_id ASC",
        )
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_row).collect()
    }

    /// Delete rows the legacy system stopped reporting: anything last synced
    /// before the cutoff. Returns the number of pruned rows.
    pub async fn delete_stale(
        &self,
        office_id: OfficeId,
        entity_type: EntityType,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM reference_records
             WHERE office_id = ? AND entity_type = ? AND last_synced_at < ?",
        )
        .bind(office_id.to_string())
        .bind(entity_type.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<ShadowRecord> {
    let decode = |msg: String| StoreError::Database(sqlx::Error::Decode(msg.into()));

    let id_raw: String = row.try_get("id")?;
    let internal_id = Uuid::parse_str(&id_raw).map_err(|e| decode(e.to_string()))?;

    let office_raw: String = row.try_get("office_id")?;
    let office_id = Uuid::parse_str(&office_raw)
        .map(OfficeId)
        .map_err(|e| decode(e.to_string()))?;

    let external_id = row
        .try_get::<Option<i64>, _>("external_id")?
        .and_then(ExternalId::from_trusted);

    let data_raw: String = row.try_get("data")?;
    let data = serde_json::from_str(&data_raw)?;

    Ok(ShadowRecord {
        internal_id,
        office_id,
        external_id,
        data,
        last_synced_at: row.try_get::<DateTime<Utc>, _>("last_synced_at")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
