//! In-memory reference store
//!
//! The whole dataset lives behind a single mutex, which makes the dequeue
//! claim trivially race-free: a batch is selected and transitioned to
//! delivering under one lock acquisition. Useful for tests, demos and
//! single-process embedding without persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{Error, Result};
use crate::id::Id;
use crate::pattern;
use crate::traits::{CatalogStore, DeliveryStore, DlqStore, EndpointStore, EventStore, Store};
use crate::types::{
    Delivery, DeliveryState, DlqEntry, Endpoint, Event, EventType, ListOptions, ListTypesOptions,
    QueueStats,
};

/// Attempt budget used for replayed deliveries when the original delivery
/// record is gone.
const REPLAY_DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct Inner {
    event_types: HashMap<String, EventType>,
    endpoints: HashMap<Id, Endpoint>,
    events: HashMap<Id, Event>,
    idempotency: HashMap<String, Id>,
    deliveries: HashMap<Id, Delivery>,
    claimed_at: HashMap<Id, DateTime<Utc>>,
    dlq: HashMap<Id, DlqEntry>,
}

/// In-memory implementation of the aggregate [`Store`] contract.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreClosed);
        }
        Ok(self.inner.lock().unwrap())
    }
}

impl CatalogStore for MemoryStore {
    fn register_type(&self, def: EventType) -> Result<EventType> {
        let mut inner = self.guard()?;
        let now = Utc::now();
        let merged = match inner.event_types.get(&def.name) {
            Some(existing) => {
                let mut updated = def;
                updated.id = existing.id.clone();
                updated.created_at = existing.created_at;
                updated.version = existing.version + 1;
                updated.is_deprecated = false;
                updated.deprecated_at = None;
                updated.updated_at = now;
                updated
            }
            None => def,
        };
        inner
            .event_types
            .insert(merged.name.clone(), merged.clone());
        Ok(merged)
    }

    fn get_type(&self, name: &str) -> Result<EventType> {
        let inner = self.guard()?;
        inner
            .event_types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::EventTypeNotFound(name.to_string()))
    }

    fn get_type_by_id(&self, id: &Id) -> Result<EventType> {
        let inner = self.guard()?;
        inner
            .event_types
            .values()
            .find(|t| &t.id == id)
            .cloned()
            .ok_or_else(|| Error::EventTypeNotFound(id.to_string()))
    }

    fn list_types(&self, opts: &ListTypesOptions) -> Result<Vec<EventType>> {
        let inner = self.guard()?;
        let mut types: Vec<EventType> = inner
            .event_types
            .values()
            .filter(|t| opts.include_deprecated || !t.is_deprecated)
            .filter(|t| opts.group.as_deref().map_or(true, |g| t.group == g))
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(opts.page.page(types))
    }

    fn delete_type(&self, name: &str) -> Result<EventType> {
        let mut inner = self.guard()?;
        let ty = inner
            .event_types
            .get_mut(name)
            .ok_or_else(|| Error::EventTypeNotFound(name.to_string()))?;
        let now = Utc::now();
        ty.is_deprecated = true;
        ty.deprecated_at = Some(now);
        ty.updated_at = now;
        Ok(ty.clone())
    }

    fn match_types(&self, pattern_str: &str) -> Result<Vec<EventType>> {
        let inner = self.guard()?;
        let mut types: Vec<EventType> = inner
            .event_types
            .values()
            .filter(|t| !t.is_deprecated && pattern::matches(pattern_str, &t.name))
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }
}

impl EndpointStore for MemoryStore {
    fn create_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let mut inner = self.guard()?;
        inner.endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    fn get_endpoint(&self, id: &Id) -> Result<Endpoint> {
        let inner = self.guard()?;
        inner
            .endpoints
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EndpointNotFound(id.to_string()))
    }

    fn update_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let mut inner = self.guard()?;
        if !inner.endpoints.contains_key(&endpoint.id) {
            return Err(Error::EndpointNotFound(endpoint.id.to_string()));
        }
        inner.endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    fn delete_endpoint(&self, id: &Id) -> Result<()> {
        let mut inner = self.guard()?;
        inner
            .endpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::EndpointNotFound(id.to_string()))
    }

    fn list_endpoints(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Endpoint>> {
        let inner = self.guard()?;
        let mut endpoints: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(opts.page(endpoints))
    }

    fn resolve(&self, tenant_id: &str, event_type: &str) -> Result<Vec<Endpoint>> {
        let inner = self.guard()?;
        let mut endpoints: Vec<Endpoint> = inner
            .endpoints
            .values()
            .filter(|e| {
                e.enabled
                    && e.tenant_id == tenant_id
                    && pattern::any_matches(&e.event_types, event_type)
            })
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(endpoints)
    }

    fn set_endpoint_enabled(&self, id: &Id, enabled: bool) -> Result<()> {
        let mut inner = self.guard()?;
        let endpoint = inner
            .endpoints
            .get_mut(id)
            .ok_or_else(|| Error::EndpointNotFound(id.to_string()))?;
        if endpoint.enabled != enabled {
            endpoint.enabled = enabled;
            endpoint.updated_at = Utc::now();
        }
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn create_event(&self, event: Event) -> Result<Event> {
        let mut inner = self.guard()?;
        if let Some(key) = event.idempotency_key.as_deref().filter(|k| !k.is_empty()) {
            if inner.idempotency.contains_key(key) {
                return Err(Error::DuplicateIdempotencyKey(key.to_string()));
            }
            inner.idempotency.insert(key.to_string(), event.id.clone());
        }
        inner.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    fn get_event(&self, id: &Id) -> Result<Event> {
        let inner = self.guard()?;
        inner
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EventNotFound(id.to_string()))
    }

    fn list_events(&self, opts: &ListOptions) -> Result<Vec<Event>> {
        let inner = self.guard()?;
        let mut events: Vec<Event> = inner.events.values().cloned().collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(opts.page(events))
    }

    fn list_events_by_tenant(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Event>> {
        let inner = self.guard()?;
        let mut events: Vec<Event> = inner
            .events
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(opts.page(events))
    }
}

impl DeliveryStore for MemoryStore {
    fn enqueue(&self, delivery: Delivery) -> Result<Delivery> {
        let mut inner = self.guard()?;
        inner.deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(delivery)
    }

    fn enqueue_batch(&self, deliveries: Vec<Delivery>) -> Result<Vec<Delivery>> {
        let mut inner = self.guard()?;
        for delivery in &deliveries {
            inner.deliveries.insert(delivery.id.clone(), delivery.clone());
        }
        Ok(deliveries)
    }

    fn dequeue(&self, limit: usize) -> Result<Vec<Delivery>> {
        let mut inner = self.guard()?;
        let now = Utc::now();

        let mut ready: Vec<(DateTime<Utc>, Id)> = inner
            .deliveries
            .values()
            .filter(|d| d.state == DeliveryState::Pending && d.next_attempt_at <= now)
            .map(|d| (d.next_attempt_at, d.id.clone()))
            .collect();
        ready.sort();
        ready.truncate(limit);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            if let Some(delivery) = inner.deliveries.get_mut(&id) {
                delivery.state = DeliveryState::Delivering;
                delivery.updated_at = now;
                claimed.push(delivery.clone());
            }
            inner.claimed_at.insert(id, now);
        }
        Ok(claimed)
    }

    fn update_delivery(&self, mut delivery: Delivery) -> Result<Delivery> {
        let mut inner = self.guard()?;
        if !inner.deliveries.contains_key(&delivery.id) {
            return Err(Error::DeliveryNotFound(delivery.id.to_string()));
        }
        delivery.updated_at = Utc::now();
        if delivery.state != DeliveryState::Delivering {
            inner.claimed_at.remove(&delivery.id);
        }
        inner.deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(delivery)
    }

    fn get_delivery(&self, id: &Id) -> Result<Delivery> {
        let inner = self.guard()?;
        inner
            .deliveries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeliveryNotFound(id.to_string()))
    }

    fn list_by_endpoint(&self, endpoint_id: &Id, opts: &ListOptions) -> Result<Vec<Delivery>> {
        let inner = self.guard()?;
        let mut deliveries: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| &d.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(opts.page(deliveries))
    }

    fn list_by_event(&self, event_id: &Id) -> Result<Vec<Delivery>> {
        let inner = self.guard()?;
        let mut deliveries: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| &d.event_id == event_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(deliveries)
    }

    fn count_pending(&self) -> Result<usize> {
        let inner = self.guard()?;
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.state == DeliveryState::Pending)
            .count())
    }

    fn recover_stale(&self, older_than: ChronoDuration) -> Result<usize> {
        let mut inner = self.guard()?;
        let cutoff = Utc::now() - older_than;
        let stale: Vec<Id> = inner
            .claimed_at
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut recovered = 0;
        let now = Utc::now();
        for id in stale {
            inner.claimed_at.remove(&id);
            if let Some(delivery) = inner.deliveries.get_mut(&id) {
                if delivery.state == DeliveryState::Delivering {
                    delivery.state = DeliveryState::Pending;
                    delivery.next_attempt_at = now;
                    delivery.last_error =
                        Some("recovered stale claim: previous attempt outcome unknown".to_string());
                    delivery.updated_at = now;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "recovered stale in-flight deliveries");
        }
        Ok(recovered)
    }

    fn stats(&self) -> Result<QueueStats> {
        let inner = self.guard()?;
        let mut stats = QueueStats::default();
        for delivery in inner.deliveries.values() {
            match delivery.state {
                DeliveryState::Pending => stats.pending += 1,
                DeliveryState::Delivering => stats.delivering += 1,
                DeliveryState::Delivered => stats.delivered += 1,
                DeliveryState::Failed => stats.failed += 1,
            }
        }
        stats.dlq = inner.dlq.len();
        Ok(stats)
    }
}

impl DlqStore for MemoryStore {
    fn push_dlq(&self, entry: DlqEntry) -> Result<DlqEntry> {
        let mut inner = self.guard()?;
        inner.dlq.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    fn list_dlq(&self, opts: &ListOptions) -> Result<Vec<DlqEntry>> {
        let inner = self.guard()?;
        let mut entries: Vec<DlqEntry> = inner.dlq.values().cloned().collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(opts.page(entries))
    }

    fn get_dlq(&self, id: &Id) -> Result<DlqEntry> {
        let inner = self.guard()?;
        inner
            .dlq
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DlqNotFound(id.to_string()))
    }

    fn replay_dlq(&self, id: &Id) -> Result<Delivery> {
        let mut inner = self.guard()?;
        let entry = inner
            .dlq
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DlqNotFound(id.to_string()))?;

        let max_attempts = inner
            .deliveries
            .get(&entry.delivery_id)
            .map(|d| d.max_attempts)
            .unwrap_or(REPLAY_DEFAULT_MAX_ATTEMPTS);

        let replacement =
            Delivery::new_pending(entry.event_id.clone(), entry.endpoint_id.clone(), max_attempts);
        inner
            .deliveries
            .insert(replacement.id.clone(), replacement.clone());

        let now = Utc::now();
        if let Some(stored) = inner.dlq.get_mut(id) {
            stored.replayed_at = Some(now);
            stored.updated_at = now;
        }
        Ok(replacement)
    }

    fn replay_dlq_bulk(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        let candidates: Vec<Id> = {
            let inner = self.guard()?;
            inner
                .dlq
                .values()
                .filter(|e| e.replayed_at.is_none() && e.failed_at >= from && e.failed_at <= to)
                .map(|e| e.id.clone())
                .collect()
        };
        let mut replayed = 0;
        for id in candidates {
            if self.replay_dlq(&id).is_ok() {
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    fn purge_dlq(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.guard()?;
        let doomed: Vec<Id> = inner
            .dlq
            .values()
            .filter(|e| e.failed_at < before)
            .map(|e| e.id.clone())
            .collect();
        for id in &doomed {
            inner.dlq.remove(id);
        }
        Ok(doomed.len())
    }

    fn count_dlq(&self) -> Result<usize> {
        let inner = self.guard()?;
        Ok(inner.dlq.len())
    }
}

impl Store for MemoryStore {
    fn migrate(&self) -> Result<()> {
        self.guard().map(|_| ())
    }

    fn ping(&self) -> Result<()> {
        self.guard().map(|_| ())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdKind;
    use serde_json::json;

    fn event_type(name: &str) -> EventType {
        let now = Utc::now();
        EventType {
            id: Id::generate(IdKind::EventType),
            name: name.to_string(),
            description: String::new(),
            group: String::new(),
            schema: None,
            schema_version: 0,
            version: 1,
            example: None,
            is_deprecated: false,
            deprecated_at: None,
            scope_app_id: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn endpoint(tenant: &str, patterns: &[&str]) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: Id::generate(IdKind::Endpoint),
            tenant_id: tenant.to_string(),
            url: "https://example.com/hook".to_string(),
            description: String::new(),
            secret: "whsec_test".to_string(),
            event_types: patterns.iter().map(|s| s.to_string()).collect(),
            headers: HashMap::new(),
            enabled: true,
            rate_limit: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn event(tenant: &str, event_type: &str, key: Option<&str>) -> Event {
        let now = Utc::now();
        Event {
            id: Id::generate(IdKind::Event),
            event_type: event_type.to_string(),
            tenant_id: tenant.to_string(),
            data: json!({"k": "v"}),
            idempotency_key: key.map(|s| s.to_string()),
            scope_app_id: None,
            scope_org_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn dlq_entry(delivery: &Delivery) -> DlqEntry {
        let now = Utc::now();
        DlqEntry {
            id: Id::generate(IdKind::Dlq),
            delivery_id: delivery.id.clone(),
            event_id: delivery.event_id.clone(),
            endpoint_id: delivery.endpoint_id.clone(),
            tenant_id: "t1".to_string(),
            event_type: "order.created".to_string(),
            url: "https://example.com/hook".to_string(),
            payload: json!({"k": "v"}),
            error: "HTTP 500".to_string(),
            attempt_count: delivery.attempt_count,
            last_status_code: Some(500),
            replayed_at: None,
            failed_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_register_type_upsert_preserves_identity() {
        let store = MemoryStore::new();
        let first = store.register_type(event_type("order.created")).unwrap();

        store.delete_type("order.created").unwrap();
        assert!(store.get_type("order.created").unwrap().is_deprecated);

        let mut again = event_type("order.created");
        again.description = "v2".to_string();
        let second = store.register_type(again).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.version, first.version + 1);
        assert!(!second.is_deprecated);
        assert!(second.deprecated_at.is_none());
        assert_eq!(second.description, "v2");
    }

    #[test]
    fn test_list_types_hides_deprecated_by_default() {
        let store = MemoryStore::new();
        store.register_type(event_type("a.one")).unwrap();
        store.register_type(event_type("b.two")).unwrap();
        store.delete_type("a.one").unwrap();

        let visible = store.list_types(&ListTypesOptions::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "b.two");

        let all = store
            .list_types(&ListTypesOptions { include_deprecated: true, ..Default::default() })
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_match_types_uses_pattern() {
        let store = MemoryStore::new();
        store.register_type(event_type("order.created")).unwrap();
        store.register_type(event_type("order.updated")).unwrap();
        store.register_type(event_type("invoice.paid")).unwrap();

        let matched = store.match_types("order.*").unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(store.match_types("*").unwrap().len(), 3);
    }

    #[test]
    fn test_resolve_filters_tenant_enabled_and_pattern() {
        let store = MemoryStore::new();
        let ep1 = store.create_endpoint(endpoint("t1", &["order.*"])).unwrap();
        let _ep2 = store.create_endpoint(endpoint("t2", &["*"])).unwrap();
        let mut disabled = endpoint("t1", &["*"]);
        disabled.enabled = false;
        store.create_endpoint(disabled).unwrap();

        let resolved = store.resolve("t1", "order.created").unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, ep1.id);

        assert!(store.resolve("t1", "invoice.paid").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_idempotency_key_rejected() {
        let store = MemoryStore::new();
        store.create_event(event("t1", "order.created", Some("k1"))).unwrap();
        let err = store
            .create_event(event("t1", "order.created", Some("k1")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdempotencyKey(_)));

        // Missing keys never collide.
        store.create_event(event("t1", "order.created", None)).unwrap();
        store.create_event(event("t1", "order.created", None)).unwrap();
    }

    #[test]
    fn test_dequeue_claims_ready_in_order() {
        let store = MemoryStore::new();
        let e = Id::generate(IdKind::Event);
        let ep = Id::generate(IdKind::Endpoint);

        let mut late = Delivery::new_pending(e.clone(), ep.clone(), 3);
        late.next_attempt_at = Utc::now() - ChronoDuration::seconds(10);
        let mut early = Delivery::new_pending(e.clone(), ep.clone(), 3);
        early.next_attempt_at = Utc::now() - ChronoDuration::seconds(60);
        let mut future = Delivery::new_pending(e, ep, 3);
        future.next_attempt_at = Utc::now() + ChronoDuration::seconds(3600);

        store.enqueue(late.clone()).unwrap();
        store.enqueue(early.clone()).unwrap();
        store.enqueue(future).unwrap();

        let batch = store.dequeue(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, early.id);
        assert_eq!(batch[1].id, late.id);
        assert!(batch.iter().all(|d| d.state == DeliveryState::Delivering));

        // Claimed deliveries are gone from the claimable set.
        assert!(store.dequeue(10).unwrap().is_empty());
    }

    #[test]
    fn test_dequeue_respects_limit() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            store
                .enqueue(Delivery::new_pending(
                    Id::generate(IdKind::Event),
                    Id::generate(IdKind::Endpoint),
                    3,
                ))
                .unwrap();
        }
        assert_eq!(store.dequeue(2).unwrap().len(), 2);
        assert_eq!(store.dequeue(10).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_dequeue_never_overlaps() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        for _ in 0..50 {
            store
                .enqueue(Delivery::new_pending(
                    Id::generate(IdKind::Event),
                    Id::generate(IdKind::Endpoint),
                    3,
                ))
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                loop {
                    let batch = store.dequeue(5).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|d| d.id));
                }
                mine
            }));
        }

        let mut all: Vec<Id> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "claims must not overlap");
        assert_eq!(total, 50);
    }

    #[test]
    fn test_recover_stale_resets_old_claims() {
        let store = MemoryStore::new();
        let d = Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        store.enqueue(d.clone()).unwrap();
        store.dequeue(1).unwrap();

        // A fresh claim is not stale.
        assert_eq!(store.recover_stale(ChronoDuration::seconds(300)).unwrap(), 0);
        // With a zero horizon everything qualifies.
        assert_eq!(store.recover_stale(ChronoDuration::seconds(-1)).unwrap(), 1);

        let recovered = store.get_delivery(&d.id).unwrap();
        assert_eq!(recovered.state, DeliveryState::Pending);
        assert!(recovered.last_error.is_some());
    }

    #[test]
    fn test_stats_counts_by_state() {
        let store = MemoryStore::new();
        let d1 = Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        let d2 = Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        store.enqueue(d1).unwrap();
        store.enqueue(d2.clone()).unwrap();

        let mut done = store.dequeue(1).unwrap().remove(0);
        done.state = DeliveryState::Delivered;
        store.update_delivery(done).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.delivering, 0);
    }

    #[test]
    fn test_replay_creates_fresh_pending_delivery() {
        let store = MemoryStore::new();
        let mut failed =
            Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        failed.state = DeliveryState::Failed;
        failed.attempt_count = 3;
        store.enqueue(failed.clone()).unwrap();

        let entry = store.push_dlq(dlq_entry(&failed)).unwrap();
        let replayed = store.replay_dlq(&entry.id).unwrap();

        assert_eq!(replayed.state, DeliveryState::Pending);
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.max_attempts, 3);
        assert_eq!(replayed.event_id, failed.event_id);
        assert_eq!(replayed.endpoint_id, failed.endpoint_id);
        assert_ne!(replayed.id, failed.id);

        assert!(store.get_dlq(&entry.id).unwrap().replayed_at.is_some());
    }

    #[test]
    fn test_replay_bulk_skips_already_replayed() {
        let store = MemoryStore::new();
        let failed =
            Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        store.enqueue(failed.clone()).unwrap();

        let e1 = store.push_dlq(dlq_entry(&failed)).unwrap();
        let _e2 = store.push_dlq(dlq_entry(&failed)).unwrap();
        store.replay_dlq(&e1.id).unwrap();

        let window = ChronoDuration::hours(1);
        let replayed = store
            .replay_dlq_bulk(Utc::now() - window, Utc::now() + window)
            .unwrap();
        assert_eq!(replayed, 1);
    }

    #[test]
    fn test_purge_by_age() {
        let store = MemoryStore::new();
        let failed =
            Delivery::new_pending(Id::generate(IdKind::Event), Id::generate(IdKind::Endpoint), 3);
        let mut old = dlq_entry(&failed);
        old.failed_at = Utc::now() - ChronoDuration::days(30);
        store.push_dlq(old).unwrap();
        store.push_dlq(dlq_entry(&failed)).unwrap();

        let purged = store.purge_dlq(Utc::now() - ChronoDuration::days(7)).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.count_dlq().unwrap(), 1);
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let store = MemoryStore::new();
        store.close().unwrap();
        assert!(matches!(store.ping(), Err(Error::StoreClosed)));
        assert!(matches!(store.count_pending(), Err(Error::StoreClosed)));
        assert!(matches!(
            store.get_type("order.created"),
            Err(Error::StoreClosed)
        ));
    }
}
