mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use slastamp::cache::{CacheInvalidator, MemoryCacheStore};
use slastamp::domain::entities::TimestampRecord;
use slastamp::domain::types::{Stage, Tag};
use slastamp::events::{
    AckMode, ConsumeApplyError, DecodeError, DeliveryOutcome, EventConsumer, EventPublisher,
    EventSubscriber, MemoryChannel, RetryBackoff, TimestampEvent,
};
use time::macros::datetime;
use uuid::Uuid;

use support::{SwitchableCacheStore, cache_over, memory_cache, memory_channel};

const TTL: Duration = Duration::from_secs(300);

fn record(id: Uuid) -> TimestampRecord {
    TimestampRecord {
        id,
        external_id: "x1".to_string(),
        timestamp: datetime!(2024-05-01 10:00 UTC),
        tag: Tag::Incident,
        stage: Stage::Created,
        meta: Default::default(),
    }
}

fn encoded(event: &TimestampEvent) -> Bytes {
    event.encode().expect("encode")
}

#[tokio::test]
async fn duplicate_deletes_leave_the_same_state() {
    let cache = memory_cache(TTL);
    let consumer = EventConsumer::new(CacheInvalidator::new(cache.clone()));
    let id = Uuid::new_v4();
    cache.set_point(&record(id)).await.expect("seed point");

    let delete = encoded(&TimestampEvent::Deleted { id });
    consumer.apply(&delete).await.expect("first delete");
    let after_first = cache.get_point(id).await.expect("read");
    consumer.apply(&delete).await.expect("second delete");
    let after_second = cache.get_point(id).await.expect("read");

    assert!(after_first.is_none());
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn created_event_populates_the_point_entry() {
    let cache = memory_cache(TTL);
    let consumer = EventConsumer::new(CacheInvalidator::new(cache.clone()));
    let id = Uuid::new_v4();

    let event = consumer
        .apply(&encoded(&TimestampEvent::Created { data: record(id) }))
        .await
        .expect("apply");

    assert_eq!(event.id(), id);
    assert_eq!(cache.get_point(id).await.expect("read"), Some(record(id)));
}

#[tokio::test]
async fn unknown_action_is_rejected_before_touching_the_cache() {
    let store = Arc::new(SwitchableCacheStore::new(false));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store.clone(), TTL)));

    let err = consumer
        .apply(br#"{"action":"update","id":"6a2f41a3-c54c-fce8-32d2-0324e1c32e22"}"#)
        .await
        .expect_err("unknown action");

    assert!(matches!(
        err,
        ConsumeApplyError::Decode(DecodeError::UnknownAction(ref action)) if action == "update"
    ));
    assert!(!err.is_retryable());
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn poison_payload_is_dead_lettered_under_after_apply() {
    let channel = memory_channel(AckMode::AfterApply, 5);
    let consumer = EventConsumer::new(CacheInvalidator::new(memory_cache(TTL)));
    channel
        .publish(Bytes::from_static(br#"{"action":"rename"}"#))
        .await
        .expect("publish");

    let mut deliveries = channel.consume();
    let delivery = deliveries.next().await.expect("delivery").expect("ok");

    assert_eq!(consumer.process(delivery).await, DeliveryOutcome::DeadLettered);
    let dead = channel.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].reason.contains("rename"));
}

#[tokio::test]
async fn poison_payload_is_dropped_under_auto() {
    let channel = memory_channel(AckMode::Auto, 5);
    let consumer = EventConsumer::new(CacheInvalidator::new(memory_cache(TTL)));
    channel
        .publish(Bytes::from_static(b"not json"))
        .await
        .expect("publish");

    let mut deliveries = channel.consume();
    let delivery = deliveries.next().await.expect("delivery").expect("ok");

    assert_eq!(consumer.process(delivery).await, DeliveryOutcome::Dropped);
    assert!(channel.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cache_failures_are_retried_until_attempts_run_out() {
    let store = Arc::new(SwitchableCacheStore::new(true));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store.clone(), TTL)));
    let channel = memory_channel(AckMode::AfterApply, 3);
    let id = Uuid::new_v4();
    channel
        .publish(encoded(&TimestampEvent::Deleted { id }))
        .await
        .expect("publish");

    let mut deliveries = channel.consume();
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let delivery = deliveries.next().await.expect("delivery").expect("ok");
        outcomes.push(consumer.process(delivery).await);
    }

    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Requeued,
            DeliveryOutcome::Requeued,
            DeliveryOutcome::DeadLettered
        ]
    );
    let dead = channel.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn redelivery_succeeds_once_the_cache_recovers() {
    let store = Arc::new(SwitchableCacheStore::new(true));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store.clone(), TTL)));
    let channel = memory_channel(AckMode::AfterApply, 3);
    let id = Uuid::new_v4();
    channel
        .publish(encoded(&TimestampEvent::Created { data: record(id) }))
        .await
        .expect("publish");

    let mut deliveries = channel.consume();
    let first = deliveries.next().await.expect("delivery").expect("ok");
    assert_eq!(consumer.process(first).await, DeliveryOutcome::Requeued);

    store.set_failing(false);
    let second = deliveries.next().await.expect("redelivery").expect("ok");
    assert_eq!(second.attempt(), 2);
    assert_eq!(consumer.process(second).await, DeliveryOutcome::Applied);
    assert!(store.inner().contains_live(&slastamp::cache::point_key(id)));
}

#[tokio::test(start_paused = true)]
async fn short_cache_outage_is_ridden_out_by_backoff() {
    let store = Arc::new(SwitchableCacheStore::new(true));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store.clone(), TTL)));
    let channel = Arc::new(
        MemoryChannel::new(AckMode::AfterApply, support::attempts(5)).with_backoff(
            RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(5)),
        ),
    );
    let id = Uuid::new_v4();
    channel
        .publish(encoded(&TimestampEvent::Created { data: record(id) }))
        .await
        .expect("publish");

    // Retries land at 100ms and 300ms; the cache is back at 250ms.
    let recovering = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        recovering.set_failing(false);
    });

    let stats = consumer
        .run(
            channel.as_ref(),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await;

    assert_eq!(stats.applied, 1);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert!(channel.dead_letters().is_empty());
    assert!(store.inner().contains_live(&slastamp::cache::point_key(id)));
}

#[tokio::test]
async fn cache_failure_under_auto_loses_the_event() {
    let store = Arc::new(SwitchableCacheStore::new(true));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store, TTL)));
    let channel = memory_channel(AckMode::Auto, 3);
    channel
        .publish(encoded(&TimestampEvent::Deleted { id: Uuid::new_v4() }))
        .await
        .expect("publish");

    let mut deliveries = channel.consume();
    let delivery = deliveries.next().await.expect("delivery").expect("ok");

    assert_eq!(consumer.process(delivery).await, DeliveryOutcome::Dropped);
    assert!(channel.dead_letters().is_empty());
}

#[tokio::test]
async fn run_drains_the_channel_and_reports_stats() {
    let store = Arc::new(MemoryCacheStore::new(support::capacity()));
    let consumer = EventConsumer::new(CacheInvalidator::new(cache_over(store.clone(), TTL)));
    let channel = memory_channel(AckMode::AfterApply, 2);
    let kept = Uuid::new_v4();
    let removed = Uuid::new_v4();

    for event in [
        TimestampEvent::Created { data: record(kept) },
        TimestampEvent::Created {
            data: record(removed),
        },
        TimestampEvent::Deleted { id: removed },
    ] {
        channel.publish(encoded(&event)).await.expect("publish");
    }
    channel
        .publish(Bytes::from_static(br#"{"id":"x"}"#))
        .await
        .expect("publish");
    channel.close().await.expect("close");

    let stats = consumer
        .run(channel.as_ref(), std::future::pending::<()>())
        .await;

    assert_eq!(stats.applied, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.requeued, 0);
    assert!(store.contains_live(&slastamp::cache::point_key(kept)));
    assert!(!store.contains_live(&slastamp::cache::point_key(removed)));
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let channel = memory_channel(AckMode::AfterApply, 2);
    let consumer = EventConsumer::new(CacheInvalidator::new(memory_cache(TTL)));

    let stats = consumer.run(channel.as_ref(), async {}).await;

    assert_eq!(stats, Default::default());
}
