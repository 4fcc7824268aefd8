//! Request and response bodies exchanged over the slastamp HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// Body of `POST /timestamps`.
///
/// Tag and stage travel as plain strings; the server validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTimestampRequest {
    #[serde(default)]
    pub external_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateTimestampResponse {
    pub id: Uuid,
}

/// Query string of `GET /timestamps`.
///
/// `meta_filter` carries a JSON object; `timestamp_from` and `timestamp_to` are RFC 3339.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTimestampsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub external_id: Option<String>,
    pub tag: Option<String>,
    pub stage: Option<String>,
    pub timestamp_from: Option<String>,
    pub timestamp_to: Option<String>,
    pub meta_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_missing_optional_fields() {
        let body = r#"{"external_id":"x1","tag":"incident","stage":"created"}"#;
        let request: CreateTimestampRequest = serde_json::from_str(body).expect("decode");

        assert_eq!(request.external_id, "x1");
        assert!(request.timestamp.is_none());
        assert!(request.meta.is_none());
    }

    #[test]
    fn create_request_parses_rfc3339_timestamp() {
        let body = r#"{"external_id":"x1","timestamp":"2024-05-01T10:00:00Z","tag":"sla","stage":"closed","meta":{"team":"core"}}"#;
        let request: CreateTimestampRequest = serde_json::from_str(body).expect("decode");

        let timestamp = request.timestamp.expect("timestamp");
        assert_eq!(timestamp.unix_timestamp(), 1_714_557_600);
        assert_eq!(
            request.meta.and_then(|meta| meta.get("team").cloned()),
            Some(Value::String("core".to_string()))
        );
    }
}
