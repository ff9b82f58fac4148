//! Wire models for the legacy case-management API.
//!
//! The legacy API speaks camelCase JSON. These structs are the only place its
//! shapes appear; everything past the client boundary uses shadow-store types.

use cb_common::ExternalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `POST /auth` request body. The response body is the literal bearer string,
/// not JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub locale: &'a str,
}

/// Page envelope returned by the legacy search endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: u32,
}

impl<T> SearchPage<T> {
    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest<'a> {
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_since: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyConstituent {
    pub id: ExternalId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub postcode: Option<String>,
    pub address: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstituentPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCase {
    pub id: ExternalId,
    pub constituent_id: Option<ExternalId>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub status_id: Option<ExternalId>,
    pub case_type_id: Option<ExternalId>,
    pub category_id: Option<ExternalId>,
    pub caseworker_id: Option<ExternalId>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CasePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constituent_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_type_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caseworker_id: Option<ExternalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEmail {
    pub id: ExternalId,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actioned: bool,
    pub constituent_id: Option<ExternalId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCasenote {
    pub id: ExternalId,
    pub case_id: Option<ExternalId>,
    pub note: Option<String>,
    pub author_id: Option<ExternalId>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CasenotePayload {
    pub case_id: ExternalId,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCaseworker {
    pub id: ExternalId,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Shared shape of the `/casetype`, `/statustype`, `/categorytype` and
/// `/contacttype` reference endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceItem {
    pub id: ExternalId,
    pub name: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// A possible constituent owner for an inbound email.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstituentMatch {
    pub constituent_id: ExternalId,
    pub score: Option<f64>,
}

/// Records created upstream come back with their assigned legacy id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRecord {
    pub id: ExternalId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_page_pagination() {
        let page: SearchPage<LegacyConstituent> = serde_json::from_value(serde_json::json!({
            "items": [{"id": 7, "firstName": "Ada"}],
            "page": 1,
            "totalPages": 2
        }))
        .unwrap();
        assert!(page.has_more());
        assert_eq!(page.items[0].id.as_i64(), 7);
        assert_eq!(page.items[0].first_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn invalid_external_id_in_page_is_rejected() {
        let result: Result<SearchPage<LegacyCase>, _> = serde_json::from_value(serde_json::json!({
            "items": [{"id": 0}],
            "page": 1,
            "totalPages": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn payload_skips_absent_fields() {
        let payload = ConstituentPayload {
            first_name: Some("Ada".to_string()),
            last_name: None,
            email: None,
            phone: None,
            postcode: None,
            address: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"firstName": "Ada"}));
    }
}
