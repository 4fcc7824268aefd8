//! Redis-backed cache store.
//!
//! Keys under a tracked prefix are also recorded in a registry set, so
//! [`CacheStore::delete_prefix`] removes them without walking the keyspace.
//! Other prefixes fall back to `SCAN MATCH`.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use super::keys::LIST_PREFIX;
use super::lock::mutex_lock;
use super::store::{CacheError, CacheStore};

const SOURCE: &str = "cache::redis_store";
const DEFAULT_SCAN_BATCH: usize = 256;
const DEFAULT_DELETE_BATCH: usize = 512;
const REGISTRY_PREFIX: &str = "registry:";

pub struct RedisCacheStore {
    conn: Mutex<Option<MultiplexedConnection>>,
    tracked_prefixes: Vec<String>,
    scan_batch: usize,
    delete_batch: usize,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(CacheError::backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::backend)?;
        info!(target = "slastamp::cache::redis", "Connected to Redis cache");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            tracked_prefixes: vec![LIST_PREFIX.to_string()],
            scan_batch: DEFAULT_SCAN_BATCH,
            delete_batch: DEFAULT_DELETE_BATCH,
        })
    }

    /// Handle onto the shared multiplexed connection, or an error once closed.
    fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        mutex_lock(&self.conn, SOURCE, "connection")
            .clone()
            .ok_or_else(|| CacheError::backend("redis connection is closed"))
    }

    fn registry_for(&self, key: &str) -> Option<String> {
        self.tracked_prefixes
            .iter()
            .find(|prefix| key.starts_with(prefix.as_str()))
            .map(|prefix| registry_key(prefix))
    }

    async fn delete_registered(
        &self,
        conn: &mut MultiplexedConnection,
        registry: &str,
    ) -> Result<u64, CacheError> {
        // Keys written after this point land in a fresh registry set.
        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .smembers(registry)
            .del(registry)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(CacheError::backend)?;

        let mut removed: u64 = 0;
        for batch in members.chunks(self.delete_batch) {
            let deleted: u64 = conn.del(batch).await.map_err(CacheError::backend)?;
            removed += deleted;
        }
        Ok(removed)
    }

    async fn delete_scanned(
        &self,
        conn: &mut MultiplexedConnection,
        prefix: &str,
    ) -> Result<u64, CacheError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_batch)
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::backend)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(CacheError::backend)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection()?;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(CacheError::backend)?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let seconds = ttl.as_secs().max(1);

        match self.registry_for(key) {
            None => {
                let _: () = conn
                    .set_ex(key, value.as_ref(), seconds)
                    .await
                    .map_err(CacheError::backend)?;
            }
            Some(registry) => {
                // The registry outlives every member it names.
                let _: () = redis::pipe()
                    .atomic()
                    .set_ex(key, value.as_ref(), seconds)
                    .ignore()
                    .sadd(&registry, key)
                    .ignore()
                    .expire(&registry, i64::try_from(seconds).unwrap_or(i64::MAX))
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(CacheError::backend)?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let _: i64 = conn.del(key).await.map_err(CacheError::backend)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection()?;
        let removed = if self.tracked_prefixes.iter().any(|tracked| tracked == prefix) {
            self.delete_registered(&mut conn, &registry_key(prefix))
                .await?
        } else {
            self.delete_scanned(&mut conn, prefix).await?
        };

        debug!(
            target = "slastamp::cache::redis",
            prefix,
            removed,
            "Deleted keys by prefix"
        );
        Ok(removed)
    }

    /// Drop the shared connection. Calls already holding a handle finish first;
    /// later calls fail with [`CacheError::Backend`].
    async fn close(&self) -> Result<(), CacheError> {
        if mutex_lock(&self.conn, SOURCE, "close").take().is_some() {
            debug!(target = "slastamp::cache::redis", "Released Redis connection");
        }
        Ok(())
    }
}

fn registry_key(prefix: &str) -> String {
    format!("{REGISTRY_PREFIX}{prefix}")
}

/// Escape glob metacharacters so a literal prefix matches only itself.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
