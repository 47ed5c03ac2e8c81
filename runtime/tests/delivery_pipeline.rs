//! End-to-end delivery tests against the in-memory broker.
//!
//! Each test declares the conventional consumer topology, publishes through the
//! broker's publisher and drives a real `ConsumerRuntime`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::NaiveDate;
use event_relay_core::broker::{Publisher, TopologyManager};
use event_relay_core::event::{Event, EventType};
use event_relay_core::handler::handler_fn;
use event_relay_core::topology::QueueTopology;
use event_relay_runtime::{ConsumerRuntime, HandleOutcome, IdempotentHandler, SubscriptionHandle};
use event_relay_testing::{
    FailOnEventIds, InMemoryBroker, InMemoryDailyMetrics, InMemoryIdempotencyStore, InMemorySyncLog,
    eventually, user_event, user_event_with_id, within,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);
const ANALYTICS_QUEUE: &str = "analytics.user.events";
const ANALYTICS_DLQ: &str = "dlq.analytics.user.events";

fn new_year() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

async fn declared_broker(service: &str) -> (InMemoryBroker, QueueTopology) {
    let broker = InMemoryBroker::new();
    let topology = QueueTopology::for_consumer(service);
    broker.declare(&topology).await.unwrap();
    (broker, topology)
}

async fn wait_for_settled(handle: &SubscriptionHandle, settled: u64) {
    assert!(
        eventually(WAIT, || handle.stats().settled() >= settled).await,
        "expected {settled} settled deliveries, got {:?}",
        handle.stats()
    );
}

#[tokio::test]
async fn republished_event_is_counted_once() {
    let (broker, topology) = declared_broker("analytics").await;
    let store = InMemoryIdempotencyStore::new();
    let metrics = InMemoryDailyMetrics::new();
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(metrics.clone()));

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();

    let event = user_event_with_id(EventType::UserCreated, "u1", "evt-1");
    broker.publish_event(&event).await.unwrap();
    wait_for_settled(&handle, 1).await;

    broker.publish_event(&event).await.unwrap();
    wait_for_settled(&handle, 2).await;

    let stats = handle.cancel().await.unwrap();
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(metrics.count(new_year(), EventType::UserCreated), 1);
    assert_eq!(store.len(), 1);
    assert_eq!(broker.queue_len(ANALYTICS_QUEUE), 0);
    assert_eq!(broker.queue_len(ANALYTICS_DLQ), 0);
}

#[tokio::test]
async fn handler_failure_routes_message_to_dead_letter_queue() {
    let (broker, topology) = declared_broker("analytics").await;
    let store = InMemoryIdempotencyStore::new();
    let metrics = InMemoryDailyMetrics::new();
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(metrics.clone()))
        .with_failure_policy(Arc::new(FailOnEventIds::new(["evt-poison"])));

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();

    let poison = user_event_with_id(EventType::UserUpdated, "u2", "evt-poison");
    broker.publish_event(&poison).await.unwrap();
    wait_for_settled(&handle, 1).await;

    let stats = handle.cancel().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.queue_len(ANALYTICS_QUEUE), 0);
    assert_eq!(broker.unacked_len(ANALYTICS_QUEUE), 0);

    let dead = broker.queue_messages(ANALYTICS_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(Event::from_json_bytes(&dead[0].body).unwrap(), poison);
    assert!(store.is_empty());
    assert_eq!(metrics.count(new_year(), EventType::UserUpdated), 0);
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_without_invoking_handler() {
    let (broker, topology) = declared_broker("crm").await;
    let invoked = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&invoked);
    let handler = handler_fn(move |_event: Event| {
        seen.store(true, Ordering::SeqCst);
        async { Ok(()) }
    });

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();

    broker
        .publish("user.created", br#"{"event_id": 42}"#, "corr-bad")
        .await
        .unwrap();
    wait_for_settled(&handle, 1).await;
    let stats = handle.cancel().await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert!(!invoked.load(Ordering::SeqCst));
    let dead = broker.queue_messages("dlq.crm.user.events");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].correlation_id.as_deref(), Some("corr-bad"));
}

#[tokio::test]
async fn deliveries_are_processed_one_at_a_time_in_queue_order() {
    let (broker, topology) = declared_broker("crm").await;
    let trace = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&trace);
    let handler = handler_fn(move |event: Event| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(format!("start {}", event.event_id));
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.lock().unwrap().push(format!("end {}", event.event_id));
            Ok(())
        }
    });

    broker
        .publish_event(&user_event_with_id(EventType::UserCreated, "u1", "A"))
        .await
        .unwrap();
    broker
        .publish_event(&user_event_with_id(EventType::UserUpdated, "u1", "B"))
        .await
        .unwrap();

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    wait_for_settled(&handle, 2).await;
    handle.cancel().await.unwrap();

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["start A", "end A", "start B", "end B"]
    );
}

#[tokio::test]
async fn cancel_waits_for_in_flight_handler() {
    let (broker, topology) = declared_broker("crm").await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
    let handler = handler_fn(move |_event: Event| {
        let (s, f) = (Arc::clone(&s), Arc::clone(&f));
        async move {
            s.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    broker
        .publish_event(&user_event(EventType::UserDeleted, "u3"))
        .await
        .unwrap();

    assert!(eventually(WAIT, || started.load(Ordering::SeqCst)).await);
    let stats = within(WAIT, handle.cancel()).await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(broker.unacked_len("crm.user.events"), 0);
    assert_eq!(broker.consumer_count("crm.user.events"), 0);
}

#[tokio::test]
async fn messages_published_while_consumer_is_down_are_delivered_later() {
    let (broker, topology) = declared_broker("crm").await;
    for user in ["u1", "u2", "u3"] {
        broker
            .publish_event(&user_event(EventType::UserCreated, user))
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_len("crm.user.events"), 3);

    let sync_log = InMemorySyncLog::new();
    let handler = IdempotentHandler::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(sync_log.clone()),
    );
    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    wait_for_settled(&handle, 3).await;
    handle.cancel().await.unwrap();

    let users: Vec<String> = sync_log.rows().into_iter().map(|r| r.user_id).collect();
    assert_eq!(users, vec!["u1", "u2", "u3"]);
}

#[tokio::test]
async fn redelivery_after_lost_ack_is_acknowledged_without_repeating_effect() {
    let (broker, topology) = declared_broker("analytics").await;
    let store = InMemoryIdempotencyStore::new();
    let metrics = InMemoryDailyMetrics::new();
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(metrics.clone()));

    // First attempt committed its effect, then the process died before acking.
    let event = user_event_with_id(EventType::UserCreated, "u1", "evt-crash");
    assert_eq!(handler.process(&event).await.unwrap(), HandleOutcome::Applied);
    broker.publish_event(&event).await.unwrap();

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    wait_for_settled(&handle, 1).await;
    let stats = handle.cancel().await.unwrap();

    assert_eq!(stats.acknowledged, 1);
    assert_eq!(metrics.count(new_year(), EventType::UserCreated), 1);
}

#[tokio::test]
async fn unavailable_idempotency_store_dead_letters_instead_of_reprocessing() {
    let (broker, topology) = declared_broker("crm").await;
    let store = InMemoryIdempotencyStore::new();
    let sync_log = InMemorySyncLog::new();
    store.set_unavailable(true);
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(sync_log.clone()));

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    broker
        .publish_event(&user_event(EventType::UserCreated, "u1"))
        .await
        .unwrap();
    wait_for_settled(&handle, 1).await;

    store.set_unavailable(false);
    broker
        .publish_event(&user_event(EventType::UserCreated, "u2"))
        .await
        .unwrap();
    wait_for_settled(&handle, 2).await;
    let stats = handle.cancel().await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acknowledged, 1);
    assert!(sync_log.rows().iter().all(|r| r.user_id == "u2"));
    assert_eq!(broker.queue_len("dlq.crm.user.events"), 1);
}

#[tokio::test]
async fn side_effect_failure_leaves_no_idempotency_record() {
    let (broker, topology) = declared_broker("crm").await;
    let store = InMemoryIdempotencyStore::new();
    let sync_log = InMemorySyncLog::new();
    sync_log.set_failing(true);
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(sync_log.clone()));

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology, handler)
        .await
        .unwrap();
    let event = user_event(EventType::UserUpdated, "u9");
    broker.publish_event(&event).await.unwrap();
    wait_for_settled(&handle, 1).await;
    handle.cancel().await.unwrap();

    assert!(store.record(&event.event_id).is_none());
    assert!(sync_log.is_empty());
    assert_eq!(broker.queue_len("dlq.crm.user.events"), 1);
}

#[tokio::test]
async fn record_failure_after_committed_effect_dead_letters() {
    let (broker, topology) = declared_broker("crm").await;
    let store = InMemoryIdempotencyStore::new();
    let sync_log = InMemorySyncLog::new();
    store.set_record_failing(true);
    let handler = IdempotentHandler::new(Arc::new(store.clone()), Arc::new(sync_log.clone()));

    let handle = ConsumerRuntime::new(Arc::new(broker.clone()))
        .subscribe(topology.clone(), handler)
        .await
        .unwrap();
    let event = user_event(EventType::UserCreated, "u5");
    broker.publish_event(&event).await.unwrap();
    wait_for_settled(&handle, 1).await;
    let stats = handle.cancel().await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(sync_log.len(), 1);
    assert!(store.record(&event.event_id).is_none());
    assert_eq!(broker.queue_len(&topology.dead_letter_queue), 1);
    assert_eq!(broker.queue_len(&topology.queue), 0);
    assert_eq!(broker.unacked_len(&topology.queue), 0);
}

#[tokio::test]
async fn every_consumer_queue_receives_its_own_copy() {
    let broker = InMemoryBroker::new();
    let crm = QueueTopology::for_consumer("crm");
    let analytics = QueueTopology::for_consumer("analytics");
    broker.declare(&crm).await.unwrap();
    broker.declare(&analytics).await.unwrap();

    let sync_log = InMemorySyncLog::new();
    let metrics = InMemoryDailyMetrics::new();
    let runtime = ConsumerRuntime::new(Arc::new(broker.clone()));
    let crm_handle = runtime
        .subscribe(
            crm,
            IdempotentHandler::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(sync_log.clone())),
        )
        .await
        .unwrap();
    let analytics_handle = runtime
        .subscribe(
            analytics,
            IdempotentHandler::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(metrics.clone())),
        )
        .await
        .unwrap();

    broker
        .publish_event(&user_event(EventType::UserDeleted, "u5"))
        .await
        .unwrap();
    wait_for_settled(&crm_handle, 1).await;
    wait_for_settled(&analytics_handle, 1).await;
    crm_handle.cancel().await.unwrap();
    analytics_handle.cancel().await.unwrap();

    assert_eq!(sync_log.len(), 1);
    assert_eq!(metrics.count(new_year(), EventType::UserDeleted), 1);
}
