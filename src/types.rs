//! Domain entities for the delivery pipeline

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::Id;

/// Maximum number of response-body bytes persisted per delivery attempt.
pub const MAX_RESPONSE_BYTES: usize = 1024;

/// A registered event type with an optional payload schema.
///
/// `name` is the identity used by events; the id exists for stable external
/// references and survives re-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventType {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub example: Option<Value>,
    #[serde(default)]
    pub is_deprecated: bool,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope_app_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering (or re-registering) an event type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTypeInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub example: Option<Value>,
    #[serde(default)]
    pub scope_app_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A receiver-side HTTP endpoint with subscription patterns and signing secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Id,
    pub tenant_id: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub secret: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub enabled: bool,
    /// Outbound requests per second; None means unlimited.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an endpoint. A missing secret is auto-generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointInput {
    pub tenant_id: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub secret: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Partial endpoint update. Empty/absent fields keep existing values;
/// a negative rate limit is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub rate_limit: Option<i64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// A tenant-scoped business fact submitted for fan-out. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub event_type: String,
    pub tenant_id: String,
    pub data: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub scope_app_id: Option<String>,
    #[serde(default)]
    pub scope_org_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ingestion input for `Relay::send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub tenant_id: String,
    pub data: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Delivery state machine: pending → delivering → {delivered | failed}.
/// Retries return the record to pending with an advanced `next_attempt_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivering,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivering => "delivering",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryState::Pending),
            "delivering" => Some(DeliveryState::Delivering),
            "delivered" => Some(DeliveryState::Delivered),
            "failed" => Some(DeliveryState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }
}

/// One attempt-bounded unit of work for a single (event, endpoint) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Id,
    pub event_id: Id,
    pub endpoint_id: Id,
    pub state: DeliveryState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_status_code: Option<u16>,
    #[serde(default)]
    pub last_response: Option<String>,
    #[serde(default)]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Build a fresh pending delivery for an (event, endpoint) pair.
    pub fn new_pending(event_id: Id, endpoint_id: Id, max_attempts: u32) -> Self {
        let now = Utc::now();
        Delivery {
            id: Id::generate(crate::id::IdKind::Delivery),
            event_id,
            endpoint_id,
            state: DeliveryState::Pending,
            attempt_count: 0,
            max_attempts,
            next_attempt_at: now,
            last_error: None,
            last_status_code: None,
            last_response: None,
            last_latency_ms: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable record of a delivery that exhausted retries or was terminated.
///
/// URL and payload are snapshots taken at failure time, so replay tolerates
/// later endpoint mutation or deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Id,
    pub delivery_id: Id,
    pub event_id: Id,
    pub endpoint_id: Id,
    pub tenant_id: String,
    pub event_type: String,
    pub url: String,
    pub payload: Value,
    pub error: String,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_status_code: Option<u16>,
    #[serde(default)]
    pub replayed_at: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pagination for list operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ListOptions {
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Filters for listing event types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTypesOptions {
    #[serde(default)]
    pub include_deprecated: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(flatten)]
    pub page: ListOptions,
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub delivering: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dlq: usize,
}

/// Truncate a response body to the persisted cap.
pub fn clip_response(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BYTES {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
