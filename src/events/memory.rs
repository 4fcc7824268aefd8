//! In-process channel for single-process deployments and tests.
//!
//! Honors [`AckMode`] the same way the durable queue does: requeued
//! deliveries go to the back of the queue with their attempt count bumped
//! once their [`RetryBackoff`] delay has passed, and exhausted or poison
//! deliveries are kept as dead letters. A retry still waiting when the
//! channel closes is dead-lettered.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::cache::lock::mutex_lock;

use super::channel::{
    AckMode, Acknowledger, ChannelError, Delivery, EventPublisher, EventSubscriber, PublishError,
    RetryBackoff, Settlement,
};

const SOURCE: &str = "events::memory";

#[derive(Debug, Clone)]
struct Envelope {
    seq: u64,
    payload: Bytes,
    attempt: u32,
}

/// A delivery that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub seq: u64,
    pub payload: Bytes,
    pub attempts: u32,
    pub reason: String,
}

struct Shared {
    sender: Mutex<Option<UnboundedSender<Envelope>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    max_attempts: u32,
    next_seq: AtomicU64,
}

impl Shared {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let sender = mutex_lock(&self.sender, SOURCE, "send");
        match sender.as_ref() {
            Some(sender) => sender.send(envelope).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    fn park(&self, envelope: &Envelope, reason: &str) -> Settlement {
        let mut dead = mutex_lock(&self.dead_letters, SOURCE, "park");
        dead.push(DeadLetter {
            seq: envelope.seq,
            payload: envelope.payload.clone(),
            attempts: envelope.attempt,
            reason: reason.to_string(),
        });
        Settlement::DeadLettered
    }

    fn requeue(&self, envelope: Envelope, reason: &str) -> Settlement {
        match self.send(envelope.clone()) {
            Ok(()) => Settlement::Requeued,
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    seq = envelope.seq,
                    error = %err,
                    "Requeue failed on closed channel; parking delivery"
                );
                self.park(&envelope, reason)
            }
        }
    }
}

pub struct MemoryChannel {
    shared: Arc<Shared>,
    receiver: Mutex<Option<UnboundedReceiver<Envelope>>>,
    ack_mode: AckMode,
    backoff: RetryBackoff,
}

impl MemoryChannel {
    pub fn new(ack_mode: AckMode, max_attempts: NonZeroU32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(sender)),
                dead_letters: Mutex::new(Vec::new()),
                max_attempts: max_attempts.get(),
                next_seq: AtomicU64::new(1),
            }),
            receiver: Mutex::new(Some(receiver)),
            ack_mode,
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        mutex_lock(&self.shared.dead_letters, SOURCE, "dead_letters").clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryChannel {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared
            .send(Envelope {
                seq,
                payload,
                attempt: 1,
            })
            .map_err(|_| PublishError::Closed)
    }

    /// Stop accepting events; the subscription ends once the backlog drains.
    async fn close(&self) -> Result<(), ChannelError> {
        mutex_lock(&self.shared.sender, SOURCE, "close").take();
        debug!(target_module = SOURCE, "Memory channel closed");
        Ok(())
    }
}

impl EventSubscriber for MemoryChannel {
    fn consume(&self) -> BoxStream<'static, Result<Delivery, ChannelError>> {
        let Some(mut receiver) = mutex_lock(&self.receiver, SOURCE, "consume").take() else {
            return stream::once(async { Err(ChannelError::AlreadyConsuming) }).boxed();
        };
        let shared = Arc::clone(&self.shared);
        let ack_mode = self.ack_mode;
        let backoff = self.backoff;

        async_stream::stream! {
            while let Some(envelope) = receiver.recv().await {
                let tag = envelope.seq.to_string();
                let delivery = match ack_mode {
                    AckMode::Auto => Delivery::settled(tag, envelope.payload, envelope.attempt),
                    AckMode::AfterApply => {
                        let payload = envelope.payload.clone();
                        let attempt = envelope.attempt;
                        let acker = MemoryAcker {
                            shared: Arc::clone(&shared),
                            envelope,
                            backoff,
                        };
                        Delivery::pending(tag, payload, attempt, Box::new(acker))
                    }
                };
                yield Ok(delivery);
            }
        }
        .boxed()
    }

    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    envelope: Envelope,
    backoff: RetryBackoff,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn nack(&self, requeue: bool, reason: &str) -> Result<Settlement, ChannelError> {
        if !requeue || self.envelope.attempt >= self.shared.max_attempts {
            return Ok(self.shared.park(&self.envelope, reason));
        }

        let retry = Envelope {
            attempt: self.envelope.attempt + 1,
            ..self.envelope.clone()
        };
        let delay = self.backoff.delay_after(self.envelope.attempt);
        if delay.is_zero() {
            return Ok(self.shared.requeue(retry, reason));
        }

        debug!(
            target_module = SOURCE,
            seq = retry.seq,
            delay_ms = delay.as_millis() as u64,
            "Delaying redelivery"
        );
        let shared = Arc::clone(&self.shared);
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.requeue(retry, &reason);
        });
        Ok(Settlement::Requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn channel(mode: AckMode, attempts: u32) -> MemoryChannel {
        MemoryChannel::new(mode, NonZeroU32::new(attempts).expect("non-zero"))
    }

    #[tokio::test]
    async fn deliveries_arrive_in_publish_order() {
        let channel = channel(AckMode::Auto, 3);
        channel.publish(Bytes::from_static(b"1")).await.expect("publish");
        channel.publish(Bytes::from_static(b"2")).await.expect("publish");
        channel.close().await.expect("close");

        let payloads: Vec<Vec<u8>> = channel
            .consume()
            .map(|delivery| delivery.expect("delivery").payload().to_vec())
            .collect()
            .await;

        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn second_subscription_is_rejected() {
        let channel = channel(AckMode::Auto, 3);
        let _first = channel.consume();
        let mut second = channel.consume();

        assert!(matches!(
            second.next().await,
            Some(Err(ChannelError::AlreadyConsuming))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn nack_requeues_until_attempts_run_out() {
        let channel = channel(AckMode::AfterApply, 2);
        channel.publish(Bytes::from_static(b"x")).await.expect("publish");
        let mut deliveries = channel.consume();

        let first = deliveries.next().await.expect("first").expect("ok");
        assert_eq!(first.attempt(), 1);
        assert_eq!(
            first.nack(true, "boom").await.expect("nack"),
            Settlement::Requeued
        );

        let second = deliveries.next().await.expect("second").expect("ok");
        assert_eq!(second.attempt(), 2);
        assert_eq!(
            second.nack(true, "boom").await.expect("nack"),
            Settlement::DeadLettered
        );

        let dead = channel.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].reason, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_delivery_waits_for_its_backoff() {
        let channel = channel(AckMode::AfterApply, 3).with_backoff(RetryBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        channel.publish(Bytes::from_static(b"x")).await.expect("publish");
        let mut deliveries = channel.consume();

        let first = deliveries.next().await.expect("first").expect("ok");
        let nacked_at = tokio::time::Instant::now();
        assert_eq!(
            first.nack(true, "boom").await.expect("nack"),
            Settlement::Requeued
        );

        let second = deliveries.next().await.expect("second").expect("ok");
        assert_eq!(second.attempt(), 2);
        assert!(nacked_at.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_retry_is_parked_when_the_channel_closes() {
        let channel = channel(AckMode::AfterApply, 3);
        channel.publish(Bytes::from_static(b"x")).await.expect("publish");
        let mut deliveries = channel.consume();

        let first = deliveries.next().await.expect("first").expect("ok");
        first.nack(true, "boom").await.expect("nack");
        channel.close().await.expect("close");

        assert!(deliveries.next().await.is_none());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let dead = channel.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let channel = channel(AckMode::Auto, 1);
        channel.close().await.expect("close");

        assert!(matches!(
            channel.publish(Bytes::from_static(b"x")).await,
            Err(PublishError::Closed)
        ));
    }
}
