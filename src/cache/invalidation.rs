//! The single routine that applies a committed mutation to the cache.
//!
//! The request path and the event consumer both go through
//! [`CacheInvalidator::invalidate_for_mutation`], so the two writers cannot
//! drift apart in what they evict or write.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::entities::TimestampRecord;

use super::store::CacheError;
use super::timestamps::TimestampCache;

const SOURCE: &str = "cache::invalidation";

/// A mutation already committed to the store.
#[derive(Debug, Clone, Copy)]
pub enum CacheMutation<'a> {
    /// The record exists with exactly this snapshot.
    Upsert(&'a TimestampRecord),
    /// The record no longer exists.
    Remove(Uuid),
}

impl CacheMutation<'_> {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Upsert(record) => record.id,
            Self::Remove(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Remove(_) => "remove",
        }
    }
}

/// Per-step outcome of one invalidation pass.
#[derive(Debug, Default)]
pub struct InvalidationReport {
    pub point: Option<CacheError>,
    pub lists: Option<CacheError>,
    pub lists_evicted: u64,
}

impl InvalidationReport {
    pub fn is_clean(&self) -> bool {
        self.point.is_none() && self.lists.is_none()
    }

    /// Collapse into the first failure, point step first.
    pub fn into_result(self) -> Result<(), CacheError> {
        match (self.point, self.lists) {
            (Some(err), _) | (None, Some(err)) => Err(err),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<TimestampCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<TimestampCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<TimestampCache> {
        &self.cache
    }

    /// Bring the cache in line with a committed mutation.
    ///
    /// 1. Delete the point entry; for an upsert, write the snapshot back with the standard TTL.
    /// 2. Evict every list entry through prefix deletion, since any list may include the record.
    ///
    /// Both steps always run. Failures are reported, never raised; a list entry
    /// repopulated by a concurrent read lives until its TTL or the next mutation.
    pub async fn invalidate_for_mutation(&self, mutation: CacheMutation<'_>) -> InvalidationReport {
        let id = mutation.id();
        let mut report = InvalidationReport::default();

        let mut point = self.cache.evict_point(id).await;
        if let CacheMutation::Upsert(record) = mutation {
            let written = self.cache.set_point(record).await;
            point = point.and(written);
        }
        report.point = point.err();

        match self.cache.evict_lists().await {
            Ok(evicted) => report.lists_evicted = evicted,
            Err(err) => report.lists = Some(err),
        }

        if report.is_clean() {
            debug!(
                target_module = SOURCE,
                timestamp_id = %id,
                mutation = mutation.kind(),
                lists_evicted = report.lists_evicted,
                "Cache invalidated for mutation"
            );
        } else {
            warn!(
                target_module = SOURCE,
                timestamp_id = %id,
                mutation = mutation.kind(),
                point_error = report.point.as_ref().map(tracing::field::display),
                list_error = report.lists.as_ref().map(tracing::field::display),
                "Cache invalidation incomplete; entries heal at TTL expiry"
            );
        }

        report
    }
}
