//! Domain enumerations aligned with persisted database enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "timestamp_tag", rename_all = "snake_case")]
pub enum Tag {
    Incident,
    Sla,
    Deployment,
    Maintenance,
    Alert,
}

impl Tag {
    pub const ALL: [Tag; 5] = [
        Tag::Incident,
        Tag::Sla,
        Tag::Deployment,
        Tag::Maintenance,
        Tag::Alert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Incident => "incident",
            Tag::Sla => "sla",
            Tag::Deployment => "deployment",
            Tag::Maintenance => "maintenance",
            Tag::Alert => "alert",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == value)
            .ok_or_else(|| DomainError::validation(format!("unknown tag `{value}`")))
    }
}

/// Lifecycle position of the tracked incident or SLA window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "timestamp_stage", rename_all = "snake_case")]
pub enum Stage {
    Created,
    Acknowledged,
    InProgress,
    Resolved,
    Closed,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Created,
        Stage::Acknowledged,
        Stage::InProgress,
        Stage::Resolved,
        Stage::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Acknowledged => "acknowledged",
            Stage::InProgress => "in_progress",
            Stage::Resolved => "resolved",
            Stage::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| DomainError::validation(format!("unknown stage `{value}`")))
    }
}
