use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Tenant & identifier types
// ============================================================================

/// Opaque tenant identifier. Every credential, job, shadow row and audit row
/// is scoped by exactly one office; there is no cross-tenant visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfficeId(pub Uuid);

impl OfficeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OfficeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OfficeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The legacy system's numeric identifier for a record.
///
/// Distinct from internal UUID primary keys so the two can never be mixed.
/// Constructed only via [`ExternalId::from_trusted`], never parsed ad hoc
/// from untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExternalId(i64);

impl ExternalId {
    /// Convert a value already validated by the legacy system. Rejects
    /// non-positive ids.
    pub fn from_trusted(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        ExternalId::from_trusted(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid external id: {raw}")))
    }
}

impl std::fmt::Display for ExternalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Entity types
// ============================================================================

/// The kinds of legacy records the engine mirrors into the shadow store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Constituents,
    Cases,
    Emails,
    Casenotes,
    Caseworkers,
    CaseTypes,
    StatusTypes,
    CategoryTypes,
    ContactTypes,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Constituents,
        EntityType::Cases,
        EntityType::Emails,
        EntityType::Casenotes,
        EntityType::Caseworkers,
        EntityType::CaseTypes,
        EntityType::StatusTypes,
        EntityType::CategoryTypes,
        EntityType::ContactTypes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Constituents => "constituents",
            EntityType::Cases => "cases",
            EntityType::Emails => "emails",
            EntityType::Casenotes => "casenotes",
            EntityType::Caseworkers => "caseworkers",
            EntityType::CaseTypes => "case_types",
            EntityType::StatusTypes => "status_types",
            EntityType::CategoryTypes => "category_types",
            EntityType::ContactTypes => "contact_types",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }

    /// Reference data is pulled wholesale and pruned when the legacy system
    /// stops reporting a row; domain entities are never pruned.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            EntityType::Caseworkers
                | EntityType::CaseTypes
                | EntityType::StatusTypes
                | EntityType::CategoryTypes
                | EntityType::ContactTypes
        )
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sync status & audit trail
// ============================================================================

/// One row per (office, entity type) recording the last sync. A row with a
/// non-null `last_sync_started_at` and a null `last_sync_completed_at` means
/// a sync is in progress; that is the basis of the overlap invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub office_id: OfficeId,
    pub entity_type: EntityType,
    pub last_sync_started_at: Option<DateTime<Utc>>,
    pub last_sync_completed_at: Option<DateTime<Utc>>,
    pub last_sync_success: Option<bool>,
    pub last_sync_error: Option<String>,
    pub cursor: Option<String>,
    pub records_synced: i64,
    pub records_failed: i64,
}

impl SyncStatus {
    pub fn is_in_progress(&self) -> bool {
        self.last_sync_started_at.is_some() && self.last_sync_completed_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Conflict,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Create => "create",
            AuditOperation::Update => "update",
            AuditOperation::Delete => "delete",
            AuditOperation::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(AuditOperation::Create),
            "update" => Some(AuditOperation::Update),
            "delete" => Some(AuditOperation::Delete),
            "conflict" => Some(AuditOperation::Conflict),
            _ => None,
        }
    }
}

/// Append-only record of one mutation attempt. Write-once; used for forensic
/// replay and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub office_id: OfficeId,
    pub entity_type: EntityType,
    pub operation: AuditOperation,
    pub external_id: Option<ExternalId>,
    pub internal_id: Option<Uuid>,
    pub old_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
    pub conflict_resolution: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(office_id: OfficeId, entity_type: EntityType, operation: AuditOperation) -> Self {
        Self {
            office_id,
            entity_type,
            operation,
            external_id: None,
            internal_id: None,
            old_data: None,
            new_data: None,
            conflict_resolution: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, id: ExternalId) -> Self {
        self.external_id = Some(id);
        self
    }

    pub fn with_internal_id(mut self, id: Uuid) -> Self {
        self.internal_id = Some(id);
        self
    }

    pub fn with_new_data(mut self, data: serde_json::Value) -> Self {
        self.new_data = Some(data);
        self
    }

    pub fn with_old_data(mut self, data: serde_json::Value) -> Self {
        self.old_data = Some(data);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

// ============================================================================
// Job names & payloads
// ============================================================================

/// Stable job-name strings used as the queue routing key.
pub mod job_names {
    pub const SYNC_ENTITY: &str = "sync-entity";
    pub const SYNC_ALL: &str = "sync-all";
    pub const PUSH_ENTITY: &str = "push-entity";
    pub const TRIAGE_PROCESS_EMAIL: &str = "triage-process-email";
    pub const CLEANUP_REFERENCE_DATA: &str = "cleanup-reference-data";
}

/// Pull one entity type for one office from the legacy system.
///
/// Immutable value record; carries enough identifying data to be reprocessed
/// idempotently on duplicate delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub office_id: OfficeId,
    pub entity_type: EntityType,
    /// Incremental cursor (timestamp or page marker); `None` starts from the
    /// beginning.
    pub cursor: Option<String>,
    /// Full re-sync ignores the stored cursor.
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOperation {
    Create,
    Update,
}

/// Mirror one local mutation up to the legacy system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushJobPayload {
    pub office_id: OfficeId,
    pub entity_type: EntityType,
    pub internal_id: Uuid,
    pub external_id: Option<ExternalId>,
    pub operation: PushOperation,
}

/// Hand a freshly-synced inbound email to the triage subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageJobPayload {
    pub office_id: OfficeId,
    pub email_id: Uuid,
    pub external_email_id: ExternalId,
}

/// Batch payload for the recurring scheduler: sync every entity type for one
/// office.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAllPayload {
    pub office_id: OfficeId,
    #[serde(default)]
    pub full: bool,
}

/// Prune reference rows the legacy system no longer reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub office_id: OfficeId,
    pub stale_after_days: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_rejects_non_positive() {
        assert!(ExternalId::from_trusted(0).is_none());
        assert!(ExternalId::from_trusted(-5).is_none());
        assert_eq!(ExternalId::from_trusted(42).unwrap().as_i64(), 42);
    }

    #[test]
    fn external_id_deserialize_validates() {
        let ok: ExternalId = serde_json::from_str("17").unwrap();
        assert_eq!(ok.as_i64(), 17);
        assert!(serde_json::from_str::<ExternalId>("-1").is_err());
    }

    #[test]
    fn entity_type_round_trips_names() {
        for et in EntityType::ALL {
            assert_eq!(EntityType::parse(et.as_str()), Some(et));
        }
        assert!(EntityType::parse("bogus").is_none());
    }

    #[test]
    fn reference_entities_flagged() {
        assert!(EntityType::Caseworkers.is_reference());
        assert!(EntityType::ContactTypes.is_reference());
        assert!(!EntityType::Cases.is_reference());
        assert!(!EntityType::Emails.is_reference());
    }

    #[test]
    fn sync_status_in_progress() {
        let mut status = SyncStatus {
            office_id: OfficeId::new(),
            entity_type: EntityType::Cases,
            last_sync_started_at: Some(Utc::now()),
            last_sync_completed_at: None,
            last_sync_success: None,
            last_sync_error: None,
            cursor: None,
            records_synced: 0,
            records_failed: 0,
        };
        assert!(status.is_in_progress());
        status.last_sync_completed_at = Some(Utc::now());
        assert!(!status.is_in_progress());
    }
}
