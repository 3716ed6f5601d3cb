//! End-to-end tests for the delivery pipeline.
//!
//! Exercises the full flow: register type → create endpoint → send →
//! engine claims → sender POSTs → retrier classifies → terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use relay::mocks::{RecordedSender, SendBehavior};
use relay::traits::{DeliveryStore, EventStore, Store};
use relay::types::{
    DeliveryState, EndpointInput, EventTypeInput, ListOptions, NewEvent, QueueStats,
};
use relay::{MemoryStore, Relay, RelayConfig, SqliteStore};

/// Engine tuning for tests: fast polls, fast backoff.
fn test_config() -> RelayConfig {
    RelayConfig {
        concurrency: 4,
        poll_interval: Duration::from_millis(10),
        batch_size: 20,
        max_attempts: 3,
        request_timeout: Duration::from_secs(5),
        backoff: vec![Duration::from_millis(10), Duration::from_millis(20)],
        cache_ttl: Duration::ZERO,
    }
}

fn build_relay(store: Arc<dyn Store>, sender: Arc<RecordedSender>) -> Relay {
    Relay::with_sender(store, sender, test_config())
}

fn register_order_created(relay: &Relay) {
    relay
        .catalog()
        .register_type(EventTypeInput {
            name: "order.created".to_string(),
            ..Default::default()
        })
        .unwrap();
}

fn subscribe(relay: &Relay, tenant: &str, patterns: &[&str]) -> relay::types::Endpoint {
    relay
        .endpoints()
        .create(EndpointInput {
            tenant_id: tenant.to_string(),
            url: "https://example.com/hook".to_string(),
            event_types: patterns.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .unwrap()
}

fn order_event(tenant: &str) -> NewEvent {
    NewEvent {
        event_type: "order.created".to_string(),
        tenant_id: tenant.to_string(),
        data: json!({"id": "O1"}),
        idempotency_key: None,
    }
}

/// Poll the relay until the predicate holds or the deadline passes.
async fn wait_for(relay: &Relay, predicate: impl Fn(&QueueStats) -> bool) {
    for _ in 0..300 {
        if predicate(&relay.stats().unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_happy_delivery() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::success());
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);

    relay.send(order_event("t1")).unwrap();
    assert_eq!(relay.stats().unwrap().pending, 1);

    relay.start();
    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    let stats = relay.stats().unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dlq, 0);

    // Exactly one POST with the raw event data as body.
    let requests = sender.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "https://example.com/hook");
    assert_eq!(requests[0].payload, json!({"id": "O1"}));
    assert_eq!(requests[0].event_type, "order.created");
    assert!(requests[0].event_id.starts_with("evt_"));
    assert!(requests[0].delivery_id.starts_with("del_"));

    let event = store.list_events(&ListOptions::default()).unwrap().remove(0);
    let delivery = store.list_by_event(&event.id).unwrap().remove(0);
    assert_eq!(delivery.state, DeliveryState::Delivered);
    assert_eq!(delivery.last_status_code, Some(200));
    assert!(delivery.completed_at.is_some());
}

#[tokio::test]
async fn test_retry_then_success() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::sequence(vec![500, 500, 200]));
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    assert_eq!(relay.stats().unwrap().delivered, 1);
    assert_eq!(relay.dlq().count().unwrap(), 0);
    assert!(sender.call_count() >= 3, "two failures plus the success");

    let event = store.list_events(&ListOptions::default()).unwrap().remove(0);
    let delivery = store.list_by_event(&event.id).unwrap().remove(0);
    assert!(delivery.attempt_count >= 3);
    assert_eq!(delivery.last_status_code, Some(200));
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::status(500));
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.failed == 1).await;
    relay.stop().await;

    let stats = relay.stats().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dlq, 1);
    assert_eq!(sender.call_count(), 3, "max_attempts bounds the tries");

    let entries = relay.dlq().list(&ListOptions::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].last_status_code, Some(500));
    assert_eq!(entries[0].attempt_count, 3);
    assert_eq!(entries[0].tenant_id, "t1");
    assert_eq!(entries[0].event_type, "order.created");
    assert_eq!(entries[0].payload, json!({"id": "O1"}));
}

#[tokio::test]
async fn test_410_gone_disables_endpoint() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::status(410));
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    let endpoint = subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.failed == 1).await;
    relay.stop().await;

    assert_eq!(sender.call_count(), 1, "410 never retries");
    assert_eq!(relay.dlq().count().unwrap(), 1);
    assert!(!relay.endpoints().get(&endpoint.id).unwrap().enabled);

    // The disabled endpoint no longer resolves: nothing new is enqueued.
    relay.send(order_event("t1")).unwrap();
    assert_eq!(relay.stats().unwrap().pending, 0);
}

#[tokio::test]
async fn test_idempotent_send_no_refanout() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::success());
    let relay = build_relay(store.clone(), sender);

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);

    let keyed = NewEvent {
        idempotency_key: Some("k1".to_string()),
        ..order_event("t1")
    };
    relay.send(keyed.clone()).unwrap();
    assert_eq!(relay.stats().unwrap().pending, 1);

    relay.send(keyed).unwrap();
    assert_eq!(relay.stats().unwrap().pending, 1);
    assert_eq!(store.list_events(&ListOptions::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::success());
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    let ep_t1 = subscribe(&relay, "t1", &["*"]);
    let _ep_t2 = subscribe(&relay, "t2", &["*"]);

    relay.send(order_event("t1")).unwrap();
    assert_eq!(relay.stats().unwrap().pending, 1);

    relay.start();
    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    let requests = sender.requests();
    assert_eq!(requests.len(), 1);
    let deliveries = store
        .list_by_endpoint(&ep_t1.id, &ListOptions::default())
        .unwrap();
    assert_eq!(deliveries.len(), 1);
}

#[tokio::test]
async fn test_dlq_replay_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::status(500));
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.dlq == 1).await;

    // The receiver recovers; replay the dead letter.
    sender.set_behavior(SendBehavior::AlwaysStatus(200));
    let entry = relay.dlq().list(&ListOptions::default()).unwrap().remove(0);
    let replayed = relay.dlq().replay(&entry.id).unwrap();
    assert_eq!(replayed.attempt_count, 0);

    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    assert_eq!(relay.stats().unwrap().delivered, 1);
    assert!(relay
        .dlq()
        .get(&entry.id)
        .unwrap()
        .replayed_at
        .is_some());
}

#[tokio::test]
async fn test_dlq_purge() {
    let store = Arc::new(MemoryStore::new());
    let sender = Arc::new(RecordedSender::status(400));
    let relay = build_relay(store.clone(), sender);

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.dlq == 1).await;
    relay.stop().await;

    assert_eq!(relay.dlq().count().unwrap(), 1);
    let purged = relay
        .dlq()
        .purge(Utc::now() + ChronoDuration::seconds(1))
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(relay.dlq().count().unwrap(), 0);
}

#[tokio::test]
async fn test_full_pipeline_on_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.migrate().unwrap();
    let sender = Arc::new(RecordedSender::sequence(vec![500, 200]));
    let relay = build_relay(store.clone(), sender.clone());

    register_order_created(&relay);
    subscribe(&relay, "t1", &["order.*"]);
    relay.send(order_event("t1")).unwrap();

    relay.start();
    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    let stats = relay.stats().unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dlq, 0);
    assert!(sender.call_count() >= 2);

    let event = store.list_events(&ListOptions::default()).unwrap().remove(0);
    let delivery = store.list_by_event(&event.id).unwrap().remove(0);
    assert_eq!(delivery.state, DeliveryState::Delivered);
    assert!(delivery.attempt_count >= 2);
}

#[tokio::test]
async fn test_pipeline_survives_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.sqlite");

    // First process: ingest but never start the engine.
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        store.migrate().unwrap();
        let relay = build_relay(store, Arc::new(RecordedSender::success()));
        register_order_created(&relay);
        subscribe(&relay, "t1", &["order.*"]);
        relay.send(order_event("t1")).unwrap();
        assert_eq!(relay.stats().unwrap().pending, 1);
    }

    // Second process: the queued delivery is still there and gets delivered.
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    store.migrate().unwrap();
    let sender = Arc::new(RecordedSender::success());
    let relay = build_relay(store, sender.clone());

    assert_eq!(relay.stats().unwrap().pending, 1);
    relay.start();
    wait_for(&relay, |s| s.delivered == 1).await;
    relay.stop().await;

    assert_eq!(relay.stats().unwrap().delivered, 1);
    assert_eq!(sender.call_count(), 1);
}
