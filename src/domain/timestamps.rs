//! Validation and normalization rules for timestamp events and their queries.

use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use uuid::Uuid;

use super::entities::TimestampRecord;
use super::error::DomainError;
use super::types::{Stage, Tag};

pub const DEFAULT_LIST_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 1000;

/// Unvalidated attributes of a timestamp event as supplied by a caller.
#[derive(Debug, Clone, Default)]
pub struct CreateTimestampCommand {
    pub external_id: String,
    pub timestamp: Option<OffsetDateTime>,
    pub tag: String,
    pub stage: String,
    pub meta: Map<String, Value>,
}

/// Validated attributes ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTimestamp {
    pub external_id: String,
    pub timestamp: OffsetDateTime,
    pub tag: Tag,
    pub stage: Stage,
    pub meta: Map<String, Value>,
}

impl NewTimestamp {
    pub fn validate(command: CreateTimestampCommand) -> Result<Self, DomainError> {
        let external_id = command.external_id.trim();
        if external_id.is_empty() {
            return Err(DomainError::validation("external_id is required"));
        }

        let timestamp = command
            .timestamp
            .ok_or_else(|| DomainError::validation("timestamp is required"))?;
        let timestamp = normalize_instant(timestamp)?;

        let tag = command.tag.trim().parse::<Tag>()?;
        let stage = command.stage.trim().parse::<Stage>()?;
        ensure_meta_keys(&command.meta, "meta")?;

        Ok(Self {
            external_id: external_id.to_string(),
            timestamp,
            tag,
            stage,
            meta: command.meta,
        })
    }

    /// Attach the store-assigned identifier.
    pub fn into_record(self, id: Uuid) -> TimestampRecord {
        TimestampRecord {
            id,
            external_id: self.external_id,
            timestamp: self.timestamp,
            tag: self.tag,
            stage: self.stage,
            meta: self.meta,
        }
    }
}

/// Filter and page parameters for listing timestamp events.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampQuery {
    pub limit: u32,
    pub offset: u32,
    pub external_id: Option<String>,
    pub tag: Option<Tag>,
    pub stage: Option<Stage>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    /// Containment filter: every pair must be present in a record's meta.
    pub meta: Map<String, Value>,
}

impl Default for TimestampQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            external_id: None,
            tag: None,
            stage: None,
            from: None,
            to: None,
            meta: Map::new(),
        }
    }
}

impl TimestampQuery {
    /// Check bounds and bring equivalent filters to one representation.
    pub fn validate(self) -> Result<Self, DomainError> {
        if self.limit == 0 || self.limit > MAX_LIST_LIMIT {
            return Err(DomainError::validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }

        let from = self.from.map(to_utc);
        let to = self.to.map(to_utc);
        if matches!((from, to), (Some(from), Some(to)) if from > to) {
            return Err(DomainError::validation(
                "timestamp_from must not be after timestamp_to",
            ));
        }

        ensure_meta_keys(&self.meta, "meta_filter")?;

        let external_id = self
            .external_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            external_id,
            from,
            to,
            ..self
        })
    }

    pub fn matches(&self, record: &TimestampRecord) -> bool {
        if self
            .external_id
            .as_deref()
            .is_some_and(|external_id| record.external_id != external_id)
        {
            return false;
        }
        if self.tag.is_some_and(|tag| tag != record.tag) {
            return false;
        }
        if self.stage.is_some_and(|stage| stage != record.stage) {
            return false;
        }
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        self.meta
            .iter()
            .all(|(key, expected)| record.meta.get(key).is_some_and(|v| contains(v, expected)))
    }
}

/// JSON containment with the semantics of Postgres `@>` for objects and scalars.
pub fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|v| contains(v, value))),
        (Value::Array(have), Value::Array(want)) => want
            .iter()
            .all(|item| have.iter().any(|candidate| contains(candidate, item))),
        (Value::Array(have), scalar) if !scalar.is_object() && !scalar.is_array() => {
            have.iter().any(|candidate| candidate == scalar)
        }
        (have, want) => have == want,
    }
}

/// UTC with microsecond precision, matching what Postgres `timestamptz` retains.
pub fn normalize_instant(value: OffsetDateTime) -> Result<OffsetDateTime, DomainError> {
    let utc = to_utc(value);
    let micros = utc.nanosecond() / 1_000 * 1_000;
    utc.replace_nanosecond(micros)
        .map_err(|err| DomainError::validation(format!("timestamp out of range: {err}")))
}

fn to_utc(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(UtcOffset::UTC)
}

fn ensure_meta_keys(meta: &Map<String, Value>, field: &str) -> Result<(), DomainError> {
    if meta.keys().any(|key| key.trim().is_empty()) {
        return Err(DomainError::validation(format!(
            "{field} keys must not be empty"
        )));
    }
    Ok(())
}
