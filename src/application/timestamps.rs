//! Timestamp write and read paths.
//!
//! Writes commit to the store first. The cache update and the event publish
//! that follow are best effort and never change the caller-visible result.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::repos::{RepoError, TimestampsRepo};
use crate::cache::{CacheInvalidator, CacheMutation, TimestampCache};
use crate::domain::entities::TimestampRecord;
use crate::domain::error::DomainError;
use crate::domain::timestamps::{CreateTimestampCommand, NewTimestamp, TimestampQuery};
use crate::events::{EventPublisher, TimestampEvent, publish_event};

const SOURCE: &str = "application::timestamps";
const METRIC_PUBLISH_FAILED: &str = "slastamp_publish_failed_total";
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TimestampServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timestamp not found")]
    NotFound,
    #[error(transparent)]
    Store(RepoError),
}

impl From<DomainError> for TimestampServiceError {
    fn from(err: DomainError) -> Self {
        Self::InvalidInput(err.message().to_string())
    }
}

impl From<RepoError> for TimestampServiceError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => Self::NotFound,
            RepoError::InvalidInput { message } => Self::InvalidInput(message),
            other => Self::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct TimestampService {
    repo: Arc<dyn TimestampsRepo>,
    cache: Arc<TimestampCache>,
    invalidator: CacheInvalidator,
    publisher: Arc<dyn EventPublisher>,
    publish_timeout: Duration,
}

impl TimestampService {
    pub fn new(
        repo: Arc<dyn TimestampsRepo>,
        cache: Arc<TimestampCache>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            invalidator: CacheInvalidator::new(Arc::clone(&cache)),
            cache,
            publisher,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    #[instrument(skip(self, command), fields(external_id = %command.external_id))]
    pub async fn create(&self, command: CreateTimestampCommand) -> Result<Uuid, TimestampServiceError> {
        let new = NewTimestamp::validate(command)?;
        let id = self.repo.create_timestamp(&new).await?;
        let record = new.into_record(id);

        self.invalidator
            .invalidate_for_mutation(CacheMutation::Upsert(&record))
            .await;
        self.publish(TimestampEvent::Created { data: record }).await;

        info!(target_module = SOURCE, timestamp_id = %id, "Timestamp created");
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), TimestampServiceError> {
        ensure_id(id)?;
        self.repo.delete_timestamp(id).await?;

        self.invalidator
            .invalidate_for_mutation(CacheMutation::Remove(id))
            .await;
        self.publish(TimestampEvent::Deleted { id }).await;

        info!(target_module = SOURCE, timestamp_id = %id, "Timestamp deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: Uuid) -> Result<TimestampRecord, TimestampServiceError> {
        ensure_id(id)?;
        if let Some(record) = self.cache.lookup_point(id).await {
            return Ok(record);
        }

        let record = self
            .repo
            .find_timestamp(id)
            .await?
            .ok_or(TimestampServiceError::NotFound)?;
        self.cache.fill_point(&record).await;
        Ok(record)
    }

    #[instrument(skip(self, query))]
    pub async fn list(
        &self,
        query: TimestampQuery,
    ) -> Result<Vec<TimestampRecord>, TimestampServiceError> {
        let query = query.validate()?;
        if let Some(records) = self.cache.lookup_list(&query).await {
            return Ok(records);
        }

        let records = self.repo.list_timestamps(&query).await?;
        self.cache.fill_list(&query, &records).await;
        Ok(records)
    }

    /// Store liveness; the cache and channel are optional for serving.
    pub async fn ping(&self) -> Result<(), TimestampServiceError> {
        self.repo.ping().await.map_err(TimestampServiceError::Store)
    }

    /// Fire-and-forget notification. A lost event is only healed by TTL expiry
    /// on caches this process does not write.
    async fn publish(&self, event: TimestampEvent) {
        let action = event.action();
        let id = event.id();
        if let Err(err) = publish_event(self.publisher.as_ref(), &event, self.publish_timeout).await {
            counter!(METRIC_PUBLISH_FAILED, "action" => action).increment(1);
            warn!(
                target_module = SOURCE,
                timestamp_id = %id,
                action,
                error = %err,
                "Event publish failed; consumer caches converge at TTL expiry"
            );
        }
    }
}

fn ensure_id(id: Uuid) -> Result<(), TimestampServiceError> {
    if id.is_nil() {
        return Err(TimestampServiceError::InvalidInput(
            "id must not be nil".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::num::NonZeroUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use time::macros::datetime;
    use tokio::sync::Mutex;

    use super::*;
    use crate::cache::{CacheConfig, MemoryCacheStore};
    use crate::events::PublishError;

    #[derive(Default)]
    struct StubRepo {
        rows: Mutex<HashMap<Uuid, TimestampRecord>>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl TimestampsRepo for StubRepo {
        async fn create_timestamp(&self, new: &NewTimestamp) -> Result<Uuid, RepoError> {
            self.calls.lock().await.push("create");
            let id = Uuid::new_v4();
            self.rows
                .lock()
                .await
                .insert(id, new.clone().into_record(id));
            Ok(id)
        }

        async fn find_timestamp(&self, id: Uuid) -> Result<Option<TimestampRecord>, RepoError> {
            self.calls.lock().await.push("find");
            Ok(self.rows.lock().await.get(&id).cloned())
        }

        async fn delete_timestamp(&self, id: Uuid) -> Result<(), RepoError> {
            self.calls.lock().await.push("delete");
            self.rows
                .lock()
                .await
                .remove(&id)
                .map(|_| ())
                .ok_or(RepoError::NotFound)
        }

        async fn list_timestamps(
            &self,
            query: &TimestampQuery,
        ) -> Result<Vec<TimestampRecord>, RepoError> {
            self.calls.lock().await.push("list");
            Ok(self
                .rows
                .lock()
                .await
                .values()
                .filter(|record| query.matches(record))
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        payloads: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
            self.payloads.lock().await.push(payload);
            Ok(())
        }
    }

    fn service() -> (Arc<StubRepo>, Arc<RecordingPublisher>, TimestampService) {
        let repo = Arc::new(StubRepo::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let store = Arc::new(MemoryCacheStore::new(
            NonZeroUsize::new(64).expect("non-zero"),
        ));
        let cache = Arc::new(TimestampCache::new(store, CacheConfig::default()));
        let service = TimestampService::new(repo.clone(), cache, publisher.clone());
        (repo, publisher, service)
    }

    fn command() -> CreateTimestampCommand {
        CreateTimestampCommand {
            external_id: "x1".to_string(),
            timestamp: Some(datetime!(2024-05-01 10:00 UTC)),
            tag: "incident".to_string(),
            stage: "created".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_publishes_created_event() {
        let (_, publisher, service) = service();

        let id = service.create(command()).await.expect("create");

        let payloads = publisher.payloads.lock().await;
        assert_eq!(payloads.len(), 1);
        let event = TimestampEvent::decode(&payloads[0]).expect("decode");
        assert_eq!(event.id(), id);
        assert_eq!(event.action(), "create");
    }

    #[tokio::test]
    async fn get_after_create_is_served_from_cache() {
        let (repo, _, service) = service();
        let id = service.create(command()).await.expect("create");

        let record = service.get_by_id(id).await.expect("get");

        assert_eq!(record.external_id, "x1");
        assert_eq!(*repo.calls.lock().await, vec!["create"]);
    }

    #[tokio::test]
    async fn invalid_create_touches_nothing() {
        let (repo, publisher, service) = service();
        let mut bad = command();
        bad.stage = "reopened".to_string();

        let err = service.create(bad).await.expect_err("invalid");

        assert!(matches!(err, TimestampServiceError::InvalidInput(_)));
        assert!(repo.calls.lock().await.is_empty());
        assert!(publisher.payloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_reports_not_found_without_publishing() {
        let (_, publisher, service) = service();

        let err = service.delete(Uuid::new_v4()).await.expect_err("missing");

        assert!(matches!(err, TimestampServiceError::NotFound));
        assert!(publisher.payloads.lock().await.is_empty());
    }

    #[tokio::test]
    async fn nil_id_is_invalid() {
        let (repo, _, service) = service();

        assert!(matches!(
            service.get_by_id(Uuid::nil()).await,
            Err(TimestampServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            service.delete(Uuid::nil()).await,
            Err(TimestampServiceError::InvalidInput(_))
        ));
        assert!(repo.calls.lock().await.is_empty());
    }
}
