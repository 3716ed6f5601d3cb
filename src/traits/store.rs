//! Aggregate persistence contract for the delivery pipeline
//!
//! One trait per subsystem, composed into [`Store`]. Backends implement the
//! whole contract; services depend only on the slice they use. All
//! operations are blocking from the caller's perspective — workers run them
//! on their own tasks.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::id::Id;
use crate::types::{
    Delivery, DlqEntry, Endpoint, Event, EventType, ListOptions, ListTypesOptions, QueueStats,
};

/// Event type catalog persistence.
pub trait CatalogStore {
    /// Upsert by name: re-registering replaces definition fields and clears
    /// deprecation, preserving the original id and `created_at`.
    fn register_type(&self, def: EventType) -> Result<EventType>;

    fn get_type(&self, name: &str) -> Result<EventType>;

    fn get_type_by_id(&self, id: &Id) -> Result<EventType>;

    fn list_types(&self, opts: &ListTypesOptions) -> Result<Vec<EventType>>;

    /// Soft delete: sets `is_deprecated` and `deprecated_at`.
    fn delete_type(&self, name: &str) -> Result<EventType>;

    /// All non-deprecated types whose name matches the dotted glob pattern.
    fn match_types(&self, pattern: &str) -> Result<Vec<EventType>>;
}

/// Endpoint persistence.
pub trait EndpointStore {
    fn create_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint>;

    fn get_endpoint(&self, id: &Id) -> Result<Endpoint>;

    fn update_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint>;

    fn delete_endpoint(&self, id: &Id) -> Result<()>;

    fn list_endpoints(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Endpoint>>;

    /// Enabled endpoints in the tenant with at least one pattern matching
    /// the event type.
    fn resolve(&self, tenant_id: &str, event_type: &str) -> Result<Vec<Endpoint>>;

    fn set_endpoint_enabled(&self, id: &Id, enabled: bool) -> Result<()>;
}

/// Event persistence.
pub trait EventStore {
    /// Returns `DuplicateIdempotencyKey` when a non-empty key already exists.
    fn create_event(&self, event: Event) -> Result<Event>;

    fn get_event(&self, id: &Id) -> Result<Event>;

    fn list_events(&self, opts: &ListOptions) -> Result<Vec<Event>>;

    fn list_events_by_tenant(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Event>>;
}

/// Durable delivery queue.
pub trait DeliveryStore {
    fn enqueue(&self, delivery: Delivery) -> Result<Delivery>;

    fn enqueue_batch(&self, deliveries: Vec<Delivery>) -> Result<Vec<Delivery>>;

    /// The race-free claim primitive: atomically transition up to `limit`
    /// deliveries that are pending with `next_attempt_at <= now` into the
    /// delivering state and return them, ordered by ascending
    /// `next_attempt_at`. Concurrent callers never receive overlapping sets.
    fn dequeue(&self, limit: usize) -> Result<Vec<Delivery>>;

    fn update_delivery(&self, delivery: Delivery) -> Result<Delivery>;

    fn get_delivery(&self, id: &Id) -> Result<Delivery>;

    fn list_by_endpoint(&self, endpoint_id: &Id, opts: &ListOptions) -> Result<Vec<Delivery>>;

    fn list_by_event(&self, event_id: &Id) -> Result<Vec<Delivery>>;

    fn count_pending(&self) -> Result<usize>;

    /// Reset deliveries stuck in the delivering state longer than
    /// `older_than` back to pending. Returns how many were recovered.
    fn recover_stale(&self, older_than: chrono::Duration) -> Result<usize>;

    fn stats(&self) -> Result<QueueStats>;
}

/// Dead letter queue persistence.
pub trait DlqStore {
    fn push_dlq(&self, entry: DlqEntry) -> Result<DlqEntry>;

    fn list_dlq(&self, opts: &ListOptions) -> Result<Vec<DlqEntry>>;

    fn get_dlq(&self, id: &Id) -> Result<DlqEntry>;

    /// Re-enqueue a fresh pending delivery for the entry's event and
    /// endpoint, and mark the entry replayed. Returns the new delivery.
    fn replay_dlq(&self, id: &Id) -> Result<Delivery>;

    /// Replay every unreplayed entry with `failed_at` in `[from, to]`.
    /// Returns how many were replayed.
    fn replay_dlq_bulk(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize>;

    /// Delete entries with `failed_at < before`. Returns how many.
    fn purge_dlq(&self, before: DateTime<Utc>) -> Result<usize>;

    fn count_dlq(&self) -> Result<usize>;
}

/// The aggregate store contract.
pub trait Store:
    CatalogStore + EndpointStore + EventStore + DeliveryStore + DlqStore + Send + Sync
{
    /// Idempotent schema setup.
    fn migrate(&self) -> Result<()>;

    fn ping(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}
