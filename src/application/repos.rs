//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::TimestampRecord;
use crate::domain::timestamps::{NewTimestamp, TimestampQuery};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Durable source of truth for timestamp events.
#[async_trait]
pub trait TimestampsRepo: Send + Sync {
    /// Persist a validated event and return the identifier assigned by the store.
    async fn create_timestamp(&self, new: &NewTimestamp) -> Result<Uuid, RepoError>;

    async fn find_timestamp(&self, id: Uuid) -> Result<Option<TimestampRecord>, RepoError>;

    /// Remove an event. Fails with [`RepoError::NotFound`] when no row matched.
    async fn delete_timestamp(&self, id: Uuid) -> Result<(), RepoError>;

    /// Newest first, applying every filter and the page window of `query`.
    async fn list_timestamps(&self, query: &TimestampQuery)
    -> Result<Vec<TimestampRecord>, RepoError>;

    /// Cheap liveness probe used by the health endpoint.
    async fn ping(&self) -> Result<(), RepoError> {
        Ok(())
    }
}
