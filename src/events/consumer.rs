//! Detached consumer that re-applies committed mutations to the cache.
//!
//! Each delivery moves through `waiting → decoding → applying → settled`.
//! Deliveries are handled one at a time in channel order.

use std::future::Future;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheError, CacheInvalidator, CacheMutation};

use super::channel::{Delivery, EventSubscriber, Settlement};
use super::event::{DecodeError, TimestampEvent};

const SOURCE: &str = "events::consumer";
const METRIC_CONSUMER_EVENTS: &str = "slastamp_consumer_events_total";
const METRIC_CONSUMER_APPLY_MS: &str = "slastamp_consumer_apply_ms";

#[derive(Debug, Error)]
pub enum ConsumeApplyError {
    #[error("event could not be decoded: {0}")]
    Decode(#[from] DecodeError),
    #[error("cache apply failed: {0}")]
    Cache(#[from] CacheError),
}

impl ConsumeApplyError {
    /// Retrying helps only when the payload itself was fine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Applied,
    Dropped,
    Requeued,
    DeadLettered,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Dropped => "dropped",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub applied: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub channel_errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Applied => self.applied += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

pub struct EventConsumer {
    invalidator: CacheInvalidator,
}

impl EventConsumer {
    pub fn new(invalidator: CacheInvalidator) -> Self {
        Self { invalidator }
    }

    /// Decode a payload and apply it through the shared invalidation routine.
    pub async fn apply(&self, payload: &[u8]) -> Result<TimestampEvent, ConsumeApplyError> {
        debug!(target_module = SOURCE, phase = "decoding", bytes = payload.len());
        let event = TimestampEvent::decode(payload)?;

        debug!(
            target_module = SOURCE,
            phase = "applying",
            action = event.action(),
            timestamp_id = %event.id()
        );
        let mutation = match &event {
            TimestampEvent::Created { data } => CacheMutation::Upsert(data),
            TimestampEvent::Deleted { id } => CacheMutation::Remove(*id),
        };
        self.invalidator
            .invalidate_for_mutation(mutation)
            .await
            .into_result()?;

        Ok(event)
    }

    /// Apply one delivery and settle it according to the channel's ack mode.
    #[instrument(skip(self, delivery), fields(delivery_tag = %delivery.tag(), delivery_attempt = delivery.attempt()))]
    pub async fn process(&self, delivery: Delivery) -> DeliveryOutcome {
        let started_at = Instant::now();
        let result = self.apply(delivery.payload()).await;
        histogram!(METRIC_CONSUMER_APPLY_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        let outcome = match result {
            Ok(event) => {
                if let Err(err) = delivery.ack().await {
                    // The apply stands; a redelivery re-applies the same mutation.
                    warn!(
                        target_module = SOURCE,
                        timestamp_id = %event.id(),
                        error = %err,
                        "Failed to acknowledge applied delivery"
                    );
                }
                DeliveryOutcome::Applied
            }
            Err(err) => self.settle_failure(delivery, err).await,
        };

        counter!(METRIC_CONSUMER_EVENTS, "outcome" => outcome.as_str()).increment(1);
        debug!(target_module = SOURCE, phase = "settled", outcome = outcome.as_str());
        outcome
    }

    async fn settle_failure(&self, delivery: Delivery, err: ConsumeApplyError) -> DeliveryOutcome {
        error!(
            target_module = SOURCE,
            delivery_tag = %delivery.tag(),
            delivery_attempt = delivery.attempt(),
            retryable = err.is_retryable(),
            error = %err,
            "Failed to apply event"
        );

        if delivery.is_settled() {
            return DeliveryOutcome::Dropped;
        }

        let reason = err.to_string();
        match delivery.nack(err.is_retryable(), &reason).await {
            Ok(Settlement::Requeued) => DeliveryOutcome::Requeued,
            Ok(Settlement::DeadLettered) => DeliveryOutcome::DeadLettered,
            Ok(Settlement::Dropped) => DeliveryOutcome::Dropped,
            Err(nack_err) => {
                // Unsettled deliveries come back once the channel lease expires.
                warn!(
                    target_module = SOURCE,
                    error = %nack_err,
                    "Failed to settle delivery; relying on redelivery"
                );
                DeliveryOutcome::Requeued
            }
        }
    }

    /// Consume until the subscription ends or `shutdown` resolves.
    ///
    /// A delivery already being applied is finished before shutdown is honored.
    pub async fn run(
        &self,
        subscriber: &dyn EventSubscriber,
        shutdown: impl Future<Output = ()>,
    ) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut deliveries = subscriber.consume();
        tokio::pin!(shutdown);

        info!(
            target_module = SOURCE,
            ack_mode = %subscriber.ack_mode(),
            "Event consumption starting"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(target_module = SOURCE, "Event consumption stopping on shutdown");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let outcome = self.process(delivery).await;
                        stats.record(outcome);
                    }
                    Some(Err(err)) => {
                        stats.channel_errors += 1;
                        warn!(target_module = SOURCE, error = %err, "Channel delivery failed");
                    }
                    None => {
                        info!(target_module = SOURCE, "Event subscription ended");
                        break;
                    }
                },
            }
        }

        info!(
            target_module = SOURCE,
            applied = stats.applied,
            dropped = stats.dropped,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Event consumption finished"
        );
        stats
    }
}
