//! Endpoint CRUD, secret management and enable/disable

use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::id::{Id, IdKind};
use crate::signer;
use crate::traits::{EndpointStore, Store};
use crate::types::{Endpoint, EndpointInput, EndpointUpdate, ListOptions};

/// Endpoint management service.
#[derive(Clone)]
pub struct EndpointService {
    store: Arc<dyn Store>,
}

impl EndpointService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        EndpointService { store }
    }

    /// Create an endpoint. A missing secret is generated; endpoints start
    /// enabled.
    pub fn create(&self, input: EndpointInput) -> Result<Endpoint> {
        if input.tenant_id.trim().is_empty() {
            return Err(Error::Validation("tenant_id is required".to_string()));
        }
        validate_url(&input.url)?;
        if input.event_types.is_empty() {
            return Err(Error::Validation(
                "at least one event type pattern is required".to_string(),
            ));
        }

        let secret = if input.secret.is_empty() {
            signer::generate_secret()
        } else {
            input.secret
        };

        let now = Utc::now();
        let endpoint = Endpoint {
            id: Id::generate(IdKind::Endpoint),
            tenant_id: input.tenant_id,
            url: input.url,
            description: input.description,
            secret,
            event_types: input.event_types,
            headers: input.headers,
            enabled: true,
            rate_limit: input.rate_limit,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        };
        let created = self.store.create_endpoint(endpoint)?;
        tracing::info!(endpoint = %created.id, tenant = %created.tenant_id, "endpoint created");
        Ok(created)
    }

    pub fn get(&self, id: &Id) -> Result<Endpoint> {
        self.store.get_endpoint(id)
    }

    pub fn list(&self, tenant_id: &str, opts: &ListOptions) -> Result<Vec<Endpoint>> {
        self.store.list_endpoints(tenant_id, opts)
    }

    /// Partial update: empty fields keep existing values, an empty pattern
    /// list leaves prior patterns intact, a negative rate limit is ignored.
    pub fn update(&self, id: &Id, update: EndpointUpdate) -> Result<Endpoint> {
        let mut endpoint = self.store.get_endpoint(id)?;

        if let Some(url) = update.url.filter(|u| !u.is_empty()) {
            validate_url(&url)?;
            endpoint.url = url;
        }
        if let Some(description) = update.description {
            endpoint.description = description;
        }
        if !update.event_types.is_empty() {
            endpoint.event_types = update.event_types;
        }
        if let Some(headers) = update.headers {
            endpoint.headers = headers;
        }
        if let Some(metadata) = update.metadata {
            endpoint.metadata = metadata;
        }
        if let Some(rate) = update.rate_limit {
            if rate >= 0 {
                // Zero clears the limit.
                endpoint.rate_limit = (rate > 0).then_some(rate as u32);
            }
        }

        self.store.update_endpoint(endpoint)
    }

    pub fn delete(&self, id: &Id) -> Result<()> {
        self.store.delete_endpoint(id)
    }

    /// Idempotent enable/disable.
    pub fn set_enabled(&self, id: &Id, enabled: bool) -> Result<()> {
        self.store.set_endpoint_enabled(id, enabled)?;
        tracing::info!(endpoint = %id, enabled, "endpoint enabled flag set");
        Ok(())
    }

    /// Replace the signing secret and return the fresh value.
    pub fn rotate_secret(&self, id: &Id) -> Result<String> {
        let mut endpoint = self.store.get_endpoint(id)?;
        let secret = signer::generate_secret();
        endpoint.secret = secret.clone();
        self.store.update_endpoint(endpoint)?;
        tracing::info!(endpoint = %id, "endpoint secret rotated");
        Ok(secret)
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Validation("url is required".to_string()));
    }
    reqwest::Url::parse(url)
        .map_err(|e| Error::Validation(format!("invalid url {url:?}: {e}")))?;
    Ok(())
}
