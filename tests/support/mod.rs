//! Shared fixtures for integration tests: an in-memory store, cache stores
//! that fail on demand, and publishers that record or refuse events.

#![allow(dead_code)]

use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use slastamp::application::repos::{RepoError, TimestampsRepo};
use slastamp::application::timestamps::TimestampService;
use slastamp::cache::{CacheConfig, CacheError, CacheStore, MemoryCacheStore, TimestampCache};
use slastamp::domain::entities::TimestampRecord;
use slastamp::domain::timestamps::{CreateTimestampCommand, NewTimestamp, TimestampQuery};
use slastamp::events::{AckMode, EventPublisher, MemoryChannel, PublishError};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Store double that honours the list ordering and paging of the real table.
#[derive(Default)]
pub struct InMemoryRepo {
    rows: Mutex<HashMap<Uuid, TimestampRecord>>,
    calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryRepo {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    fn enter(&self) -> Result<(), RepoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Persistence("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TimestampsRepo for InMemoryRepo {
    async fn create_timestamp(&self, new: &NewTimestamp) -> Result<Uuid, RepoError> {
        self.enter()?;
        let id = Uuid::new_v4();
        self.rows
            .lock()
            .await
            .insert(id, new.clone().into_record(id));
        Ok(id)
    }

    async fn find_timestamp(&self, id: Uuid) -> Result<Option<TimestampRecord>, RepoError> {
        self.enter()?;
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn delete_timestamp(&self, id: Uuid) -> Result<(), RepoError> {
        self.enter()?;
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
        self.enter()?;
        let mut records: Vec<TimestampRecord> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(records
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect())
    }

    async fn ping(&self) -> Result<(), RepoError> {
        self.enter()
    }
}

/// Cache store whose failures can be switched on and off; delegates to memory otherwise.
pub struct SwitchableCacheStore {
    inner: MemoryCacheStore,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl SwitchableCacheStore {
    pub fn new(failing: bool) -> Self {
        Self {
            inner: MemoryCacheStore::new(capacity()),
            failing: AtomicBool::new(failing),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryCacheStore {
        &self.inner
    }

    fn check(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SwitchableCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.check()?;
        self.inner.delete_prefix(prefix).await
    }
}

/// Publisher that keeps every payload it accepted.
#[derive(Default)]
pub struct RecordingPublisher {
    pub payloads: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        self.payloads.lock().await.push(payload);
        Ok(())
    }
}

/// Publisher whose broker is always down.
#[derive(Default)]
pub struct FailingPublisher {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _payload: Bytes) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Channel("broker unreachable".to_string()))
    }
}

pub fn capacity() -> NonZeroUsize {
    NonZeroUsize::new(1024).expect("non-zero capacity")
}

pub fn attempts(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).expect("non-zero attempts")
}

pub fn cache_over(store: Arc<dyn CacheStore>, ttl: Duration) -> Arc<TimestampCache> {
    Arc::new(TimestampCache::new(
        store,
        CacheConfig {
            ttl,
            ..CacheConfig::default()
        },
    ))
}

pub fn memory_cache(ttl: Duration) -> Arc<TimestampCache> {
    cache_over(Arc::new(MemoryCacheStore::new(capacity())), ttl)
}

pub fn memory_channel(mode: AckMode, max_attempts: u32) -> Arc<MemoryChannel> {
    Arc::new(MemoryChannel::new(mode, attempts(max_attempts)))
}

pub fn service(
    repo: Arc<InMemoryRepo>,
    cache: Arc<TimestampCache>,
    publisher: Arc<dyn EventPublisher>,
) -> TimestampService {
    TimestampService::new(repo, cache, publisher)
}

pub fn command(external_id: &str, tag: &str, stage: &str, at: OffsetDateTime) -> CreateTimestampCommand {
    CreateTimestampCommand {
        external_id: external_id.to_string(),
        timestamp: Some(at),
        tag: tag.to_string(),
        stage: stage.to_string(),
        meta: Map::new(),
    }
}

pub fn command_with_meta(
    external_id: &str,
    at: OffsetDateTime,
    meta: Value,
) -> CreateTimestampCommand {
    let meta = match meta {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    CreateTimestampCommand {
        meta,
        ..command(external_id, "incident", "created", at)
    }
}

pub fn query_for(external_id: &str) -> TimestampQuery {
    TimestampQuery {
        external_id: Some(external_id.to_string()),
        ..TimestampQuery::default()
    }
}
