//! Change events: wire codec, channel contracts, and the detached consumer.

pub mod channel;
pub mod consumer;
pub mod event;
pub mod memory;

pub use channel::{
    AckMode, Acknowledger, ChannelError, Delivery, EventPublisher, EventSubscriber, PublishError,
    RetryBackoff, Settlement, publish_event,
};
pub use consumer::{ConsumeApplyError, ConsumerStats, DeliveryOutcome, EventConsumer};
pub use event::{DecodeError, EncodeError, TimestampEvent};
pub use memory::{DeadLetter, MemoryChannel};
