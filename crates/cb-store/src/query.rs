//! Explicit query specification for repository reads.
//!
//! A tagged struct of filters, translated once into SQL by each repository.
//! Callers state what they want; the repository owns how that becomes a
//! query.

use cb_common::{EntityType, ExternalId, OfficeId};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

/// Filters for listing shadow or audit rows. Always office-scoped.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub office_id: OfficeId,
    pub entity_type: Option<EntityType>,
    pub external_id: Option<ExternalId>,
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub order: SortOrder,
}

impl QuerySpec {
    pub fn for_office(office_id: OfficeId) -> Self {
        Self {
            office_id,
            entity_type: None,
            external_id: None,
            updated_since: None,
            limit: None,
            order: SortOrder::Descending,
        }
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn external_id(mut self, external_id: ExternalId) -> Self {
        self.external_id = Some(external_id);
        self
    }

    pub fn updated_since(mut self, since: DateTime<Utc>) -> Self {
        self.updated_since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }
}
