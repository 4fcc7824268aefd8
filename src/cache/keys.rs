//! Cache key definitions.
//!
//! Point entries are addressed by entity id, list entries by a digest of the
//! normalized query so that every process derives the same key for the same
//! filters.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::timestamps::TimestampQuery;

pub const POINT_PREFIX: &str = "entity:";
pub const LIST_PREFIX: &str = "list:";

/// A key in one of the two disjoint cache families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Point(Uuid),
    List { fingerprint: String },
}

impl CacheKey {
    pub fn list(query: &TimestampQuery) -> Self {
        Self::List {
            fingerprint: fingerprint(query),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Point(_) => "point",
            Self::List { .. } => "list",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Point(id) => write!(f, "{POINT_PREFIX}{id}"),
            Self::List { fingerprint } => write!(f, "{LIST_PREFIX}{fingerprint}"),
        }
    }
}

pub fn point_key(id: Uuid) -> String {
    CacheKey::Point(id).to_string()
}

pub fn list_key(query: &TimestampQuery) -> String {
    CacheKey::list(query).to_string()
}

/// Lowercase hex SHA-256 of [`canonicalize`].
pub fn fingerprint(query: &TimestampQuery) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(query).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a query into a byte-stable form.
///
/// Fields appear in a fixed order as a JSON array:
/// `[limit, offset, external_id, tag, stage, from, to, meta]`. Absent filters,
/// a blank external id and an empty meta filter all become `null`. Instants
/// are UTC unix nanoseconds. Meta becomes sorted `[key, value]` pairs and
/// nested objects are written with sorted keys.
pub fn canonicalize(query: &TimestampQuery) -> String {
    let mut out = String::with_capacity(96);
    out.push('[');
    out.push_str(&query.limit.to_string());
    out.push(',');
    out.push_str(&query.offset.to_string());
    out.push(',');
    write_optional_str(
        &mut out,
        query
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty()),
    );
    out.push(',');
    write_optional_str(&mut out, query.tag.map(|tag| tag.as_str()));
    out.push(',');
    write_optional_str(&mut out, query.stage.map(|stage| stage.as_str()));
    out.push(',');
    write_optional_raw(
        &mut out,
        query.from.map(|from| from.unix_timestamp_nanos().to_string()),
    );
    out.push(',');
    write_optional_raw(
        &mut out,
        query.to.map(|to| to.unix_timestamp_nanos().to_string()),
    );
    out.push(',');
    write_meta(&mut out, &query.meta);
    out.push(']');
    out
}

fn write_optional_str(out: &mut String, value: Option<&str>) {
    match value {
        Some(value) => write_str(out, value),
        None => out.push_str("null"),
    }
}

fn write_optional_raw(out: &mut String, value: Option<String>) {
    match value {
        Some(value) => out.push_str(&value),
        None => out.push_str("null"),
    }
}

fn write_meta(out: &mut String, meta: &Map<String, Value>) {
    if meta.is_empty() {
        out.push_str("null");
        return;
    }
    out.push('[');
    for (index, (key, value)) in sorted_entries(meta).into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push('[');
        write_str(out, key);
        out.push(',');
        write_value(out, value);
        out.push(']');
    }
    out.push(']');
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push('{');
            for (index, (key, value)) in sorted_entries(map).into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_str(out, key);
                out.push(':');
                write_value(out, value);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_str(out: &mut String, value: &str) {
    out.push_str(&Value::String(value.to_string()).to_string());
}

fn sorted_entries(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|left, right| left.0.cmp(right.0));
    entries
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::domain::types::{Stage, Tag};

    fn meta(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn point_key_uses_entity_prefix() {
        let id = Uuid::nil();
        assert_eq!(point_key(id), "entity:00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn canonical_form_is_stable() {
        let query = TimestampQuery {
            tag: Some(Tag::Incident),
            meta: meta(&[("b", json!(1)), ("a", json!("x"))]),
            ..TimestampQuery::default()
        };

        insta::assert_snapshot!(
            canonicalize(&query),
            @r#"[10,0,null,"incident",null,null,null,[["a","x"],["b",1]]]"#
        );
    }

    #[test]
    fn canonical_form_sorts_nested_objects() {
        let query = TimestampQuery {
            stage: Some(Stage::InProgress),
            meta: meta(&[("labels", json!({"z": true, "a": [2, {"y": 1, "b": null}]}))]),
            ..TimestampQuery::default()
        };

        insta::assert_snapshot!(
            canonicalize(&query),
            @r#"[10,0,null,null,"in_progress",null,null,[["labels",{"a":[2,{"b":null,"y":1}],"z":true}]]]"#
        );
    }

    #[test]
    fn list_key_ignores_meta_insertion_order() {
        let forward = TimestampQuery {
            meta: meta(&[("team", json!("core")), ("region", json!("eu"))]),
            ..TimestampQuery::default()
        };
        let reverse = TimestampQuery {
            meta: meta(&[("region", json!("eu")), ("team", json!("core"))]),
            ..TimestampQuery::default()
        };

        assert_eq!(list_key(&forward), list_key(&reverse));
        assert_eq!(list_key(&forward), list_key(&forward.clone()));
    }

    #[test]
    fn list_key_has_prefix_and_sha256_hex() {
        let key = list_key(&TimestampQuery::default());
        let digest = key.strip_prefix(LIST_PREFIX).expect("list prefix");

        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn absent_and_blank_filters_share_a_key() {
        let absent = TimestampQuery::default();
        let blank = TimestampQuery {
            external_id: Some("  ".to_string()),
            ..TimestampQuery::default()
        };
        assert_eq!(list_key(&absent), list_key(&blank));
    }

    #[test]
    fn instants_compare_across_offsets() {
        let utc = TimestampQuery {
            from: Some(datetime!(2024-05-01 10:00 UTC)),
            ..TimestampQuery::default()
        };
        let shifted = TimestampQuery {
            from: Some(datetime!(2024-05-01 12:00 +02:00)),
            ..TimestampQuery::default()
        };
        assert_eq!(list_key(&utc), list_key(&shifted));
    }

    #[test]
    fn distinct_filters_produce_distinct_keys() {
        let page_one = TimestampQuery::default();
        let page_two = TimestampQuery {
            offset: 10,
            ..TimestampQuery::default()
        };
        let tagged = TimestampQuery {
            tag: Some(Tag::Sla),
            ..TimestampQuery::default()
        };

        assert_ne!(list_key(&page_one), list_key(&page_two));
        assert_ne!(list_key(&page_one), list_key(&tagged));
    }
}
