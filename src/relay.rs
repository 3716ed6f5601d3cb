//! Relay facade: ingestion, management surfaces and lifecycle
//!
//! `send` is the ingestion entry point: it validates the event against the
//! catalog, persists it, resolves subscribed endpoints and fans out one
//! pending delivery per endpoint. It returns once everything is persisted —
//! the engine delivers asynchronously.

use std::sync::Arc;

use chrono::Utc;

use crate::catalog::Catalog;
use crate::config::RelayConfig;
use crate::dlq::DlqService;
use crate::endpoints::EndpointService;
use crate::engine::DeliveryEngine;
use crate::error::{Error, Result};
use crate::id::{Id, IdKind};
use crate::production::HttpSender;
use crate::schema::SchemaValidator;
use crate::traits::{DeliverySender, DeliveryStore, EndpointStore, EventStore, Store};
use crate::types::{Delivery, Event, NewEvent, QueueStats};

/// Hook for capturing tenant scope (app and organization ids) at ingestion.
/// The default captures nothing.
pub trait ScopeCapture: Send + Sync {
    fn capture(&self, event: &NewEvent) -> (Option<String>, Option<String>);
}

/// Default scope hook: no app or organization scope.
pub struct NoopScopeCapture;

impl ScopeCapture for NoopScopeCapture {
    fn capture(&self, _event: &NewEvent) -> (Option<String>, Option<String>) {
        (None, None)
    }
}

/// The embeddable webhook delivery engine.
pub struct Relay {
    store: Arc<dyn Store>,
    catalog: Catalog,
    endpoints: EndpointService,
    dlq: DlqService,
    validator: SchemaValidator,
    engine: DeliveryEngine,
    scope: Arc<dyn ScopeCapture>,
    max_attempts: u32,
}

impl Relay {
    /// Build a relay over a store with the production HTTP sender.
    pub fn new(store: Arc<dyn Store>, config: RelayConfig) -> Result<Self> {
        let sender = Arc::new(HttpSender::new(config.request_timeout)?);
        Ok(Self::with_sender(store, sender, config))
    }

    /// Build a relay with a custom sender (used by tests and embedders that
    /// bring their own transport).
    pub fn with_sender(
        store: Arc<dyn Store>,
        sender: Arc<dyn DeliverySender>,
        config: RelayConfig,
    ) -> Self {
        Relay {
            catalog: Catalog::new(Arc::clone(&store), config.cache_ttl),
            endpoints: EndpointService::new(Arc::clone(&store)),
            dlq: DlqService::new(Arc::clone(&store)),
            validator: SchemaValidator::new(),
            engine: DeliveryEngine::new(Arc::clone(&store), sender, &config),
            scope: Arc::new(NoopScopeCapture),
            max_attempts: config.max_attempts,
            store,
        }
    }

    /// Replace the scope-capture hook.
    pub fn with_scope_capture(mut self, scope: Arc<dyn ScopeCapture>) -> Self {
        self.scope = scope;
        self
    }

    /// Ingest an event: validate, persist, fan out deliveries.
    ///
    /// A duplicate idempotency key is an idempotent no-op success; no new
    /// deliveries are enqueued for it.
    pub fn send(&self, new_event: NewEvent) -> Result<()> {
        if new_event.tenant_id.trim().is_empty() {
            return Err(Error::Validation("tenant_id is required".to_string()));
        }
        if new_event.event_type.trim().is_empty() {
            return Err(Error::Validation("event type is required".to_string()));
        }

        let et = self.catalog.get_type(&new_event.event_type)?;
        if et.is_deprecated {
            return Err(Error::EventTypeDeprecated(et.name.clone()));
        }
        self.validator
            .validate(et.schema.as_ref(), &new_event.data)?;

        let (scope_app_id, scope_org_id) = self.scope.capture(&new_event);
        let now = Utc::now();
        let event = Event {
            id: Id::generate(IdKind::Event),
            event_type: new_event.event_type,
            tenant_id: new_event.tenant_id,
            data: new_event.data,
            idempotency_key: new_event.idempotency_key,
            scope_app_id,
            scope_org_id,
            created_at: now,
            updated_at: now,
        };

        let event = match self.store.create_event(event) {
            Ok(event) => event,
            Err(Error::DuplicateIdempotencyKey(key)) => {
                tracing::debug!(key = %key, "duplicate idempotency key, skipping fan-out");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let endpoints = self.store.resolve(&event.tenant_id, &event.event_type)?;
        if endpoints.is_empty() {
            tracing::debug!(
                event = %event.id,
                event_type = %event.event_type,
                "no subscribed endpoints"
            );
            return Ok(());
        }

        let deliveries: Vec<Delivery> = endpoints
            .iter()
            .map(|endpoint| {
                Delivery::new_pending(event.id.clone(), endpoint.id.clone(), self.max_attempts)
            })
            .collect();
        let count = deliveries.len();
        self.store.enqueue_batch(deliveries)?;

        tracing::info!(
            event = %event.id,
            event_type = %event.event_type,
            tenant = %event.tenant_id,
            deliveries = count,
            "event ingested"
        );
        Ok(())
    }

    /// Launch the delivery engine.
    pub fn start(&self) {
        self.engine.start();
    }

    /// Stop the engine, draining in-flight workers.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    /// Event type management facade.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Endpoint management facade.
    pub fn endpoints(&self) -> &EndpointService {
        &self.endpoints
    }

    /// Dead letter queue facade.
    pub fn dlq(&self) -> &DlqService {
        &self.dlq
    }

    /// Aggregate queue counters.
    pub fn stats(&self) -> Result<QueueStats> {
        self.store.stats()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
