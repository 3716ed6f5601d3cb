//! JSON-Schema (draft-07) validation of event payloads
//!
//! Compiled schemas are cached keyed by a hash of their canonical bytes, so
//! re-registering the same schema never recompiles. A `None` schema is a
//! no-op success.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::{Error, Result};

/// Payload validator with a compiled-schema cache.
///
/// Safe for concurrent readers; compilation takes the write lock once per
/// distinct schema.
#[derive(Default)]
pub struct SchemaValidator {
    // The compiled schema references the document, so both live in the cache.
    cache: RwLock<HashMap<u64, (Arc<Value>, Arc<JSONSchema>)>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `data` against `schema`. `None` schema always succeeds.
    pub fn validate(&self, schema: Option<&Value>, data: &Value) -> Result<()> {
        let schema = match schema {
            Some(s) => s,
            None => return Ok(()),
        };
        let compiled = self.compiled(schema)?;
        if let Err(errors) = compiled.validate(data) {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::PayloadValidation(detail));
        }
        Ok(())
    }

    /// Drop all cached schemas.
    pub fn clear(&self) {
        self.cache.write().unwrap().clear();
    }

    /// Number of distinct compiled schemas currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    fn compiled(&self, schema: &Value) -> Result<Arc<JSONSchema>> {
        let key = canonical_key(schema)?;
        if let Some((_, compiled)) = self.cache.read().unwrap().get(&key) {
            return Ok(Arc::clone(compiled));
        }

        let doc = Arc::new(schema.clone());
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&doc)
            .map_err(|e| Error::PayloadValidation(format!("invalid schema: {e}")))?;
        let compiled = Arc::new(compiled);

        self.cache
            .write()
            .unwrap()
            .insert(key, (doc, Arc::clone(&compiled)));
        Ok(compiled)
    }
}

fn canonical_key(schema: &Value) -> Result<u64> {
    let bytes = serde_json::to_vec(schema)
        .map_err(|e| Error::PayloadValidation(format!("unserializable schema: {e}")))?;
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    Ok(hasher.finish())
}
