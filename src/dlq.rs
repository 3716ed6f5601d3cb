//! Dead letter queue service
//!
//! Entries snapshot the endpoint URL, tenant, event type and payload at
//! failure time, so replay and inspection keep working after the referents
//! are mutated or deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::id::{Id, IdKind};
use crate::traits::{DlqStore, Store};
use crate::types::{Delivery, DlqEntry, Endpoint, Event, ListOptions};

/// Facade over the store's dead letter tables.
#[derive(Clone)]
pub struct DlqService {
    store: Arc<dyn Store>,
}

impl DlqService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        DlqService { store }
    }

    /// Record a permanently failed delivery with full context.
    pub fn push_failed(
        &self,
        delivery: &Delivery,
        endpoint: &Endpoint,
        event: &Event,
    ) -> Result<DlqEntry> {
        let now = Utc::now();
        let entry = DlqEntry {
            id: Id::generate(IdKind::Dlq),
            delivery_id: delivery.id.clone(),
            event_id: event.id.clone(),
            endpoint_id: endpoint.id.clone(),
            tenant_id: event.tenant_id.clone(),
            event_type: event.event_type.clone(),
            url: endpoint.url.clone(),
            payload: event.data.clone(),
            error: delivery.last_error.clone().unwrap_or_default(),
            attempt_count: delivery.attempt_count,
            last_status_code: delivery.last_status_code,
            replayed_at: None,
            failed_at: now,
            created_at: now,
            updated_at: now,
        };
        let pushed = self.store.push_dlq(entry)?;
        tracing::warn!(
            delivery = %pushed.delivery_id,
            endpoint = %pushed.endpoint_id,
            event_type = %pushed.event_type,
            attempts = pushed.attempt_count,
            "delivery dead-lettered"
        );
        Ok(pushed)
    }

    pub fn list(&self, opts: &ListOptions) -> Result<Vec<DlqEntry>> {
        self.store.list_dlq(opts)
    }

    pub fn get(&self, id: &Id) -> Result<DlqEntry> {
        self.store.get_dlq(id)
    }

    /// Re-enqueue a fresh pending delivery for the entry's event and endpoint.
    pub fn replay(&self, id: &Id) -> Result<Delivery> {
        let delivery = self.store.replay_dlq(id)?;
        tracing::info!(entry = %id, delivery = %delivery.id, "dead letter replayed");
        Ok(delivery)
    }

    /// Replay all unreplayed entries that failed inside `[from, to]`.
    pub fn replay_bulk(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        let replayed = self.store.replay_dlq_bulk(from, to)?;
        tracing::info!(replayed, "dead letter bulk replay finished");
        Ok(replayed)
    }

    /// Delete entries that failed before the cutoff.
    pub fn purge(&self, before: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_dlq(before)?;
        if purged > 0 {
            tracing::info!(purged, "dead letter entries purged");
        }
        Ok(purged)
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count_dlq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::traits::{DeliveryStore, EventStore};
    use crate::types::DeliveryState;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::collections::HashMap;

    fn fixtures() -> (Arc<MemoryStore>, DlqService, Delivery, Endpoint, Event) {
        let store = Arc::new(MemoryStore::new());
        let svc = DlqService::new(store.clone());
        let now = Utc::now();

        let endpoint = Endpoint {
            id: Id::generate(IdKind::Endpoint),
            tenant_id: "t1".to_string(),
            url: "https://example.com/hook".to_string(),
            description: String::new(),
            secret: "whsec_test".to_string(),
            event_types: vec!["*".to_string()],
            headers: HashMap::new(),
            enabled: true,
            rate_limit: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        let event = Event {
            id: Id::generate(IdKind::Event),
            event_type: "order.created".to_string(),
            tenant_id: "t1".to_string(),
            data: json!({"id": "O1"}),
            idempotency_key: None,
            scope_app_id: None,
            scope_org_id: None,
            created_at: now,
            updated_at: now,
        };
        store.create_event(event.clone()).unwrap();

        let mut delivery = Delivery::new_pending(event.id.clone(), endpoint.id.clone(), 3);
        delivery.state = DeliveryState::Failed;
        delivery.attempt_count = 3;
        delivery.last_error = Some("HTTP 500".to_string());
        delivery.last_status_code = Some(500);
        store.enqueue(delivery.clone()).unwrap();

        (store, svc, delivery, endpoint, event)
    }

    #[test]
    fn test_push_failed_snapshots_context() {
        let (_store, svc, delivery, endpoint, event) = fixtures();
        let entry = svc.push_failed(&delivery, &endpoint, &event).unwrap();

        assert_eq!(entry.url, endpoint.url);
        assert_eq!(entry.payload, event.data);
        assert_eq!(entry.tenant_id, "t1");
        assert_eq!(entry.event_type, "order.created");
        assert_eq!(entry.error, "HTTP 500");
        assert_eq!(entry.last_status_code, Some(500));
        assert_eq!(entry.attempt_count, 3);
        assert!(entry.replayed_at.is_none());
        assert_eq!(svc.count().unwrap(), 1);
    }

    #[test]
    fn test_replay_creates_pending_delivery() {
        let (store, svc, delivery, endpoint, event) = fixtures();
        let entry = svc.push_failed(&delivery, &endpoint, &event).unwrap();

        let replayed = svc.replay(&entry.id).unwrap();
        assert_eq!(replayed.state, DeliveryState::Pending);
        assert_eq!(replayed.attempt_count, 0);
        assert_eq!(replayed.event_id, event.id);
        assert_eq!(replayed.endpoint_id, endpoint.id);

        // The replacement is immediately claimable.
        let claimed = store.dequeue(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, replayed.id);
    }

    #[test]
    fn test_replay_bulk_window() {
        let (_store, svc, delivery, endpoint, event) = fixtures();
        svc.push_failed(&delivery, &endpoint, &event).unwrap();
        svc.push_failed(&delivery, &endpoint, &event).unwrap();

        let outside = svc
            .replay_bulk(
                Utc::now() - ChronoDuration::days(2),
                Utc::now() - ChronoDuration::days(1),
            )
            .unwrap();
        assert_eq!(outside, 0);

        let inside = svc
            .replay_bulk(
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            )
            .unwrap();
        assert_eq!(inside, 2);

        // Nothing left unreplayed.
        let again = svc
            .replay_bulk(
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            )
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_purge_returns_count() {
        let (_store, svc, delivery, endpoint, event) = fixtures();
        svc.push_failed(&delivery, &endpoint, &event).unwrap();
        assert_eq!(svc.purge(Utc::now() + ChronoDuration::seconds(1)).unwrap(), 1);
        assert_eq!(svc.count().unwrap(), 0);
    }

    #[test]
    fn test_get_missing_entry() {
        let (_store, svc, ..) = fixtures();
        let ghost = Id::generate(IdKind::Dlq);
        assert!(svc.get(&ghost).is_err());
        assert!(svc.replay(&ghost).is_err());
    }
}
