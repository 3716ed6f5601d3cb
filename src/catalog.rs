//! Event type catalog with a TTL-bounded read cache
//!
//! Registration is an upsert by name: the store preserves the original id
//! and creation time, bumps the version, and clears any deprecation. Reads
//! go through an in-memory `name → EventType` cache guarded by a
//! reader-writer lock; writes populate it only after the store write
//! succeeds. A zero TTL means entries never expire.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::id::{Id, IdKind};
use crate::traits::{CatalogStore, Store};
use crate::types::{EventType, EventTypeInput, ListTypesOptions};

struct CacheEntry {
    fetched_at: Instant,
    ty: Arc<EventType>,
}

/// Catalog service over the store's event type tables.
pub struct Catalog {
    store: Arc<dyn Store>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl Catalog {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Catalog {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register or re-register an event type by name.
    pub fn register_type(&self, input: EventTypeInput) -> Result<EventType> {
        if input.name.trim().is_empty() {
            return Err(Error::Validation("event type name is required".to_string()));
        }

        let now = Utc::now();
        let candidate = EventType {
            id: Id::generate(IdKind::EventType),
            name: input.name,
            description: input.description,
            group: input.group,
            schema: input.schema,
            schema_version: input.schema_version,
            version: 1,
            example: input.example,
            is_deprecated: false,
            deprecated_at: None,
            scope_app_id: input.scope_app_id,
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.register_type(candidate)?;
        self.cache_put(stored.clone());
        tracing::debug!(name = %stored.name, version = stored.version, "event type registered");
        Ok(stored)
    }

    /// Look up an event type by name, read-through cached.
    pub fn get_type(&self, name: &str) -> Result<Arc<EventType>> {
        if let Some(cached) = self.cache_get(name) {
            return Ok(cached);
        }
        let ty = Arc::new(self.store.get_type(name)?);
        self.cache_put_arc(Arc::clone(&ty));
        Ok(ty)
    }

    pub fn get_type_by_id(&self, id: &Id) -> Result<EventType> {
        self.store.get_type_by_id(id)
    }

    pub fn list_types(&self, opts: &ListTypesOptions) -> Result<Vec<EventType>> {
        self.store.list_types(opts)
    }

    /// Soft-delete: marks the type deprecated. Events of deprecated types
    /// are rejected at ingestion.
    pub fn delete_type(&self, name: &str) -> Result<EventType> {
        let deprecated = self.store.delete_type(name)?;
        self.invalidate(name);
        tracing::info!(name = %name, "event type deprecated");
        Ok(deprecated)
    }

    /// Non-deprecated types matching a dotted glob pattern.
    pub fn match_types_for_event(&self, pattern: &str) -> Result<Vec<EventType>> {
        self.store.match_types(pattern)
    }

    /// Preload the cache with every live type.
    pub fn warm_cache(&self) -> Result<usize> {
        let types = self.store.list_types(&ListTypesOptions::default())?;
        let count = types.len();
        for ty in types {
            self.cache_put(ty);
        }
        Ok(count)
    }

    /// Drop one cached name.
    pub fn invalidate(&self, name: &str) {
        self.cache.write().unwrap().remove(name);
    }

    /// Drop the whole cache.
    pub fn invalidate_all(&self) {
        self.cache.write().unwrap().clear();
    }

    fn cache_get(&self, name: &str) -> Option<Arc<EventType>> {
        let cache = self.cache.read().unwrap();
        let entry = cache.get(name)?;
        if !self.ttl.is_zero() && entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(Arc::clone(&entry.ty))
    }

    fn cache_put(&self, ty: EventType) {
        self.cache_put_arc(Arc::new(ty));
    }

    fn cache_put_arc(&self, ty: Arc<EventType>) {
        self.cache.write().unwrap().insert(
            ty.name.clone(),
            CacheEntry {
                fetched_at: Instant::now(),
                ty,
            },
        );
    }
}
