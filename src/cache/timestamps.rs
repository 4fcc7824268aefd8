//! Typed view of the cache for timestamp records.
//!
//! Entries are JSON; every store call is bounded by the configured deadline.
//! The `lookup_*` and `fill_*` helpers serve the read path and degrade any
//! failure into a miss or a skipped write.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::entities::TimestampRecord;
use crate::domain::timestamps::TimestampQuery;

use super::config::CacheConfig;
use super::keys::{CacheKey, LIST_PREFIX};
use super::store::{CacheError, CacheStore};

const SOURCE: &str = "cache::timestamps";

pub(crate) const METRIC_CACHE_HIT: &str = "slastamp_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "slastamp_cache_miss_total";
pub(crate) const METRIC_CACHE_ERROR: &str = "slastamp_cache_error_total";

pub struct TimestampCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl TimestampCache {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get_point(&self, id: Uuid) -> Result<Option<TimestampRecord>, CacheError> {
        self.read(&CacheKey::Point(id)).await
    }

    pub async fn set_point(&self, record: &TimestampRecord) -> Result<(), CacheError> {
        self.write(&CacheKey::Point(record.id), record).await
    }

    pub async fn evict_point(&self, id: Uuid) -> Result<(), CacheError> {
        let key = CacheKey::Point(id).to_string();
        self.guard("delete", self.store.delete(&key)).await
    }

    pub async fn get_list(
        &self,
        query: &TimestampQuery,
    ) -> Result<Option<Vec<TimestampRecord>>, CacheError> {
        self.read(&CacheKey::list(query)).await
    }

    pub async fn set_list(
        &self,
        query: &TimestampQuery,
        records: &[TimestampRecord],
    ) -> Result<(), CacheError> {
        self.write(&CacheKey::list(query), records).await
    }

    /// Drop every list entry regardless of its filters.
    pub async fn evict_lists(&self) -> Result<u64, CacheError> {
        self.guard("delete_prefix", self.store.delete_prefix(LIST_PREFIX))
            .await
    }

    pub async fn lookup_point(&self, id: Uuid) -> Option<TimestampRecord> {
        let result = self.get_point(id).await;
        self.observe_lookup(&CacheKey::Point(id), result)
    }

    pub async fn lookup_list(&self, query: &TimestampQuery) -> Option<Vec<TimestampRecord>> {
        let result = self.get_list(query).await;
        self.observe_lookup(&CacheKey::list(query), result)
    }

    pub async fn fill_point(&self, record: &TimestampRecord) {
        if let Err(err) = self.set_point(record).await {
            warn!(
                target_module = SOURCE,
                timestamp_id = %record.id,
                error = %err,
                "Failed to populate point entry"
            );
        }
    }

    pub async fn fill_list(&self, query: &TimestampQuery, records: &[TimestampRecord]) {
        if let Err(err) = self.set_list(query, records).await {
            warn!(
                target_module = SOURCE,
                cache_key = %CacheKey::list(query),
                error = %err,
                "Failed to populate list entry"
            );
        }
    }

    pub async fn close(&self) {
        if let Err(err) = self.store.close().await {
            warn!(target_module = SOURCE, error = %err, "Cache store did not close cleanly");
        }
    }

    fn observe_lookup<T>(&self, key: &CacheKey, result: Result<Option<T>, CacheError>) -> Option<T> {
        match result {
            Ok(Some(value)) => {
                counter!(METRIC_CACHE_HIT, "kind" => key.kind()).increment(1);
                debug!(target_module = SOURCE, cache_key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                counter!(METRIC_CACHE_MISS, "kind" => key.kind()).increment(1);
                None
            }
            Err(err) => {
                counter!(METRIC_CACHE_MISS, "kind" => key.kind()).increment(1);
                warn!(
                    target_module = SOURCE,
                    cache_key = %key,
                    error = %err,
                    "Cache read failed; falling back to store"
                );
                None
            }
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let rendered = key.to_string();
        let payload = self.guard("get", self.store.get(&rendered)).await?;
        payload
            .map(|bytes| {
                serde_json::from_slice(&bytes).map_err(|err| CacheError::Codec(err.to_string()))
            })
            .transpose()
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        let payload =
            serde_json::to_vec(value).map_err(|err| CacheError::Codec(err.to_string()))?;
        let rendered = key.to_string();
        self.guard(
            "set",
            self.store.set(&rendered, Bytes::from(payload), self.config.ttl),
        )
        .await
    }

    async fn guard<T>(
        &self,
        op: &'static str,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let deadline = self.config.operation_timeout;
        let result = match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(deadline)),
        };
        if result.is_err() {
            counter!(METRIC_CACHE_ERROR, "op" => op).increment(1);
        }
        result
    }
}
