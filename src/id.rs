//! Prefix-qualified, k-sortable identifiers for every entity
//!
//! Identifiers render as `<prefix>_<suffix>` where the suffix is a UUIDv7 in
//! simple (dashless) form, so lexicographic order tracks creation time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Entity kinds with fixed id prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    EventType,
    Endpoint,
    Event,
    Delivery,
    Dlq,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::EventType => "evtype",
            IdKind::Endpoint => "ep",
            IdKind::Event => "evt",
            IdKind::Delivery => "del",
            IdKind::Dlq => "dlq",
        }
    }
}

/// A prefix-qualified identifier.
///
/// The zero value (`Id::default()`) serializes as the empty string and maps
/// to NULL in persistent storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Generate a fresh identifier for the given kind.
    pub fn generate(kind: IdKind) -> Self {
        Id(format!("{}_{}", kind.prefix(), Uuid::now_v7().simple()))
    }

    /// Parse an id of any kind. Requires a `<prefix>_<suffix>` shape.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (prefix, suffix) = s
            .split_once('_')
            .ok_or_else(|| Error::InvalidId(s.to_string()))?;
        if prefix.is_empty() || suffix.is_empty() {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(Id(s.to_string()))
    }

    /// Parse an id and enforce the expected kind.
    pub fn parse_as(s: &str, kind: IdKind) -> Result<Self, Error> {
        let id = Self::parse(s)?;
        if !id.is_kind(kind) {
            return Err(Error::InvalidId(s.to_string()));
        }
        Ok(id)
    }

    /// Wrap a raw id string from trusted storage without re-validating.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Id(s.into())
    }

    pub fn is_kind(&self, kind: IdKind) -> bool {
        self.0
            .split_once('_')
            .map(|(prefix, _)| prefix == kind.prefix())
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> String {
        id.0
    }
}
