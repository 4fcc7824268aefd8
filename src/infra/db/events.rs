//! Durable event queue stored in `timestamp_events`.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so several consumers can share the
//! table. Under [`AckMode::AfterApply`] a claimed row stays `processing`
//! until it is acknowledged (deleted), requeued, or dead-lettered; a row
//! whose lease expires is claimed again. A requeued row is not claimable
//! before its `next_attempt_at`, which grows with [`RetryBackoff`]. Under
//! [`AckMode::Auto`] the claim deletes the row outright.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::events::channel::{
    AckMode, Acknowledger, ChannelError, Delivery, EventPublisher, EventSubscriber, PublishError,
    RetryBackoff, Settlement,
};

const SOURCE: &str = "infra::db::events";

const CLAIM_AFTER_APPLY: &str = r#"
    UPDATE timestamp_events
       SET status = 'processing',
           attempts = attempts + 1,
           locked_at = now()
     WHERE id = (
        SELECT id
          FROM timestamp_events
         WHERE (status = 'pending' AND next_attempt_at <= now())
            OR (status = 'processing' AND locked_at < now() - make_interval(secs => $1))
         ORDER BY id
         FOR UPDATE SKIP LOCKED
         LIMIT 1
     )
    RETURNING id, payload, attempts, max_attempts
"#;

const CLAIM_AUTO: &str = r#"
    DELETE FROM timestamp_events
     WHERE id = (
        SELECT id
          FROM timestamp_events
         WHERE status = 'pending'
         ORDER BY id
         FOR UPDATE SKIP LOCKED
         LIMIT 1
     )
    RETURNING id, payload, attempts + 1 AS attempts, max_attempts
"#;

#[derive(Debug, Clone)]
pub struct PgEventQueueConfig {
    pub ack_mode: AckMode,
    pub max_attempts: NonZeroU32,
    /// Idle wait between claims when the queue is empty.
    pub poll_interval: Duration,
    /// How long a claim may stay unsettled before the row is handed out again.
    pub lease: Duration,
    pub backoff: RetryBackoff,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    payload: Vec<u8>,
    attempts: i32,
    max_attempts: i32,
}

#[derive(Clone)]
pub struct PgEventQueue {
    pool: PgPool,
    config: PgEventQueueConfig,
}

impl PgEventQueue {
    pub fn new(pool: PgPool, config: PgEventQueueConfig) -> Self {
        Self { pool, config }
    }

    pub async fn dead_letter_count(&self) -> Result<i64, ChannelError> {
        sqlx::query_scalar::<_, i64>("SELECT count(*) FROM timestamp_events WHERE status = 'dead'")
            .fetch_one(&self.pool)
            .await
            .map_err(ChannelError::backend)
    }

    async fn claim(&self) -> Result<Option<Delivery>, ChannelError> {
        loop {
            let row = match self.config.ack_mode {
                AckMode::AfterApply => sqlx::query_as::<_, ClaimedRow>(CLAIM_AFTER_APPLY)
                    .bind(self.config.lease.as_secs_f64())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(ChannelError::backend)?,
                AckMode::Auto => sqlx::query_as::<_, ClaimedRow>(CLAIM_AUTO)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(ChannelError::backend)?,
            };

            let Some(row) = row else {
                return Ok(None);
            };
            let attempt = u32::try_from(row.attempts).unwrap_or(u32::MAX);

            if self.config.ack_mode == AckMode::Auto {
                return Ok(Some(Delivery::settled(
                    row.id.to_string(),
                    Bytes::from(row.payload),
                    attempt,
                )));
            }

            // A lease expired after the final attempt: the consumer died mid-apply too often.
            if row.attempts > row.max_attempts {
                warn!(
                    target_module = SOURCE,
                    event_id = row.id,
                    attempts = row.attempts,
                    "Dead-lettering event whose lease expired after its final attempt"
                );
                settle(
                    &self.pool,
                    row.id,
                    false,
                    Duration::ZERO,
                    "lease expired after final attempt",
                )
                .await?;
                continue;
            }

            let acker = PgAcker {
                pool: self.pool.clone(),
                id: row.id,
                retry_delay: self.config.backoff.delay_after(attempt),
            };
            return Ok(Some(Delivery::pending(
                row.id.to_string(),
                Bytes::from(row.payload),
                attempt,
                Box::new(acker),
            )));
        }
    }
}

#[async_trait]
impl EventPublisher for PgEventQueue {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let max_attempts = i32::try_from(self.config.max_attempts.get()).unwrap_or(i32::MAX);
        sqlx::query("INSERT INTO timestamp_events (payload, max_attempts) VALUES ($1, $2)")
            .bind(payload.as_ref())
            .bind(max_attempts)
            .execute(&self.pool)
            .await
            .map_err(|err| PublishError::Channel(err.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.pool.close().await;
        debug!(target_module = SOURCE, "Event queue pool closed");
        Ok(())
    }
}

impl EventSubscriber for PgEventQueue {
    fn consume(&self) -> BoxStream<'static, Result<Delivery, ChannelError>> {
        let queue = self.clone();
        async_stream::stream! {
            loop {
                if queue.pool.is_closed() {
                    break;
                }
                match queue.claim().await {
                    Ok(Some(delivery)) => yield Ok(delivery),
                    Ok(None) => tokio::time::sleep(queue.config.poll_interval).await,
                    Err(err) => {
                        yield Err(err);
                        tokio::time::sleep(queue.config.poll_interval).await;
                    }
                }
            }
        }
        .boxed()
    }

    fn ack_mode(&self) -> AckMode {
        self.config.ack_mode
    }
}

struct PgAcker {
    pool: PgPool,
    id: i64,
    retry_delay: Duration,
}

#[async_trait]
impl Acknowledger for PgAcker {
    async fn ack(&self) -> Result<(), ChannelError> {
        sqlx::query("DELETE FROM timestamp_events WHERE id = $1")
            .bind(self.id)
            .execute(&self.pool)
            .await
            .map_err(ChannelError::backend)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool, reason: &str) -> Result<Settlement, ChannelError> {
        settle(&self.pool, self.id, requeue, self.retry_delay, reason).await
    }
}

/// Release a claim: back to `pending` after `retry_delay` while attempts remain and a retry
/// is wanted, else `dead`.
async fn settle(
    pool: &PgPool,
    id: i64,
    requeue: bool,
    retry_delay: Duration,
    reason: &str,
) -> Result<Settlement, ChannelError> {
    let status = sqlx::query_scalar::<_, String>(
        r#"
        UPDATE timestamp_events
           SET status = CASE
                   WHEN $2 AND attempts < max_attempts THEN 'pending'
                   ELSE 'dead'
               END,
               locked_at = NULL,
               next_attempt_at = now() + make_interval(secs => $4),
               last_error = $3
         WHERE id = $1
        RETURNING status
        "#,
    )
    .bind(id)
    .bind(requeue)
    .bind(reason)
    .bind(retry_delay.as_secs_f64())
    .fetch_optional(pool)
    .await
    .map_err(ChannelError::backend)?;

    match status.as_deref() {
        Some("pending") => Ok(Settlement::Requeued),
        Some(_) => Ok(Settlement::DeadLettered),
        None => Err(ChannelError::Backend(format!(
            "event {id} vanished before it was settled"
        ))),
    }
}
