//! Wire format of change events.
//!
//! ```json
//! {"action":"create","data":{"id":"…","external_id":"x1",…}}
//! {"action":"delete","id":"…"}
//! ```

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::TimestampRecord;

pub const ACTION_CREATE: &str = "create";
pub const ACTION_DELETE: &str = "delete";

/// A committed mutation, carrying enough to update the cache without reading the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum TimestampEvent {
    #[serde(rename = "create")]
    Created { data: TimestampRecord },
    #[serde(rename = "delete")]
    Deleted { id: Uuid },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("event payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("event payload has no `action` discriminator")]
    MissingAction,
    #[error("unknown event action `{0}`")]
    UnknownAction(String),
    #[error("invalid `{action}` event body: {reason}")]
    InvalidBody {
        action: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
#[error("failed to encode event: {0}")]
pub struct EncodeError(String);

impl TimestampEvent {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created { data } => data.id,
            Self::Deleted { id } => *id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Created { .. } => ACTION_CREATE,
            Self::Deleted { .. } => ACTION_DELETE,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| EncodeError(err.to_string()))
    }

    /// Parse a payload, rejecting anything that is not one of the known actions.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::Malformed("expected an object".to_string()));
        };

        let action = match object.remove("action") {
            Some(Value::String(action)) => action,
            Some(other) => return Err(DecodeError::UnknownAction(other.to_string())),
            None => return Err(DecodeError::MissingAction),
        };

        match action.as_str() {
            ACTION_CREATE => {
                let data = object
                    .remove("data")
                    .ok_or_else(|| invalid(ACTION_CREATE, "missing `data`"))?;
                let data: TimestampRecord = serde_json::from_value(data)
                    .map_err(|err| invalid(ACTION_CREATE, err.to_string()))?;
                if data.id.is_nil() {
                    return Err(invalid(ACTION_CREATE, "snapshot id must not be nil"));
                }
                Ok(Self::Created { data })
            }
            ACTION_DELETE => {
                let id = object
                    .remove("id")
                    .ok_or_else(|| invalid(ACTION_DELETE, "missing `id`"))?;
                let id: Uuid = serde_json::from_value(id)
                    .map_err(|err| invalid(ACTION_DELETE, err.to_string()))?;
                if id.is_nil() {
                    return Err(invalid(ACTION_DELETE, "id must not be nil"));
                }
                Ok(Self::Deleted { id })
            }
            _ => Err(DecodeError::UnknownAction(action)),
        }
    }
}

fn invalid(action: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidBody {
        action,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};
    use time::macros::datetime;

    use super::*;
    use crate::domain::types::{Stage, Tag};

    fn record() -> TimestampRecord {
        TimestampRecord {
            id: Uuid::from_u128(0x1),
            external_id: "x1".to_string(),
            timestamp: datetime!(2024-05-01 10:00 UTC),
            tag: Tag::Incident,
            stage: Stage::Created,
            meta: Map::new(),
        }
    }

    fn text(bytes: &Bytes) -> String {
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    #[test]
    fn created_wire_format() {
        let event = TimestampEvent::Created { data: record() };

        insta::assert_snapshot!(
            text(&event.encode().expect("encode")),
            @r#"{"action":"create","data":{"id":"00000000-0000-0000-0000-000000000001","external_id":"x1","timestamp":"2024-05-01T10:00:00Z","tag":"incident","stage":"created"}}"#
        );
    }

    #[test]
    fn deleted_wire_format() {
        let event = TimestampEvent::Deleted {
            id: Uuid::from_u128(0x2),
        };

        insta::assert_snapshot!(
            text(&event.encode().expect("encode")),
            @r#"{"action":"delete","id":"00000000-0000-0000-0000-000000000002"}"#
        );
    }

    #[test]
    fn decode_accepts_encoded_events() {
        let mut data = record();
        data.meta.insert("team".to_string(), json!("core"));
        let event = TimestampEvent::Created { data };

        let decoded = TimestampEvent::decode(&event.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_rejects_unknown_action() {
        let err = TimestampEvent::decode(br#"{"action":"update","id":"00000000-0000-0000-0000-000000000002"}"#)
            .expect_err("unknown action");
        assert!(matches!(err, DecodeError::UnknownAction(action) if action == "update"));
    }

    #[test]
    fn decode_rejects_missing_action_and_garbage() {
        assert!(matches!(
            TimestampEvent::decode(br#"{"id":"00000000-0000-0000-0000-000000000002"}"#),
            Err(DecodeError::MissingAction)
        ));
        assert!(matches!(
            TimestampEvent::decode(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            TimestampEvent::decode(b"[1,2]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_incomplete_bodies() {
        assert!(matches!(
            TimestampEvent::decode(br#"{"action":"create"}"#),
            Err(DecodeError::InvalidBody { action: "create", .. })
        ));
        assert!(matches!(
            TimestampEvent::decode(br#"{"action":"delete","id":"nope"}"#),
            Err(DecodeError::InvalidBody { action: "delete", .. })
        ));
        assert!(matches!(
            TimestampEvent::decode(br#"{"action":"delete","id":"00000000-0000-0000-0000-000000000000"}"#),
            Err(DecodeError::InvalidBody { action: "delete", .. })
        ));
    }
}
