//! Message channel contracts shared by publishers and the consumer.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;

use super::event::{EncodeError, TimestampEvent};

/// When a delivery counts as settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Settled at hand-out; a failed apply loses the event (at-most-once).
    Auto,
    /// Settled by the consumer after a successful apply (at-least-once).
    AfterApply,
}

impl AckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::AfterApply => "after_apply",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(AckMode::Auto),
            "after_apply" => Ok(AckMode::AfterApply),
            other => Err(format!(
                "unknown ack mode `{other}` (expected `auto` or `after_apply`)"
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel rejected publish: {0}")]
    Channel(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel is closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel backend error: {0}")]
    Backend(String),
    #[error("channel is closed")]
    Closed,
    #[error("channel subscription is already being consumed")]
    AlreadyConsuming,
}

impl ChannelError {
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Exponential delay before a requeued delivery is handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub const NONE: RetryBackoff = RetryBackoff {
        base: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay after the one-based `attempt` failed: `base * 2^(attempt - 1)`, capped at `max`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Final state of a delivery that was not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Will be delivered again.
    Requeued,
    /// Parked for inspection; never delivered again.
    DeadLettered,
    /// Already settled at hand-out; nothing more happens.
    Dropped,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

pub trait EventSubscriber: Send + Sync {
    /// Deliveries in channel order. Ends when the channel closes.
    fn consume(&self) -> BoxStream<'static, Result<Delivery, ChannelError>>;

    fn ack_mode(&self) -> AckMode;
}

/// Backend hook that settles one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), ChannelError>;

    async fn nack(&self, requeue: bool, reason: &str) -> Result<Settlement, ChannelError>;
}

/// One payload handed to the consumer.
pub struct Delivery {
    tag: String,
    payload: Bytes,
    attempt: u32,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// A delivery the consumer must settle.
    pub fn pending(
        tag: impl Into<String>,
        payload: Bytes,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag: tag.into(),
            payload,
            attempt,
            acker: Some(acker),
        }
    }

    /// A delivery the channel already settled on hand-out.
    pub fn settled(tag: impl Into<String>, payload: Bytes, attempt: u32) -> Self {
        Self {
            tag: tag.into(),
            payload,
            attempt,
            acker: None,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// One-based delivery attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_none()
    }

    pub async fn ack(self) -> Result<(), ChannelError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nack(self, requeue: bool, reason: &str) -> Result<Settlement, ChannelError> {
        match self.acker {
            Some(acker) => acker.nack(requeue, reason).await,
            None => Ok(Settlement::Dropped),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("attempt", &self.attempt)
            .field("bytes", &self.payload.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Encode and publish one event, failing with [`PublishError::Timeout`] past `deadline`.
pub async fn publish_event(
    publisher: &dyn EventPublisher,
    event: &TimestampEvent,
    deadline: Duration,
) -> Result<(), PublishError> {
    let payload = event.encode()?;
    match tokio::time::timeout(deadline, publisher.publish(payload)).await {
        Ok(result) => result,
        Err(_) => Err(PublishError::Timeout(deadline)),
    }
}
