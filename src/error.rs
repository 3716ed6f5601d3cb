//! Crate-wide error kinds for the delivery pipeline

use thiserror::Error;

/// All failure kinds surfaced by relay services and stores.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("no store configured")]
    NoStore,
    #[error("store is closed")]
    StoreClosed,
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("store error: {0}")]
    Database(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("event type not found: {0}")]
    EventTypeNotFound(String),
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("delivery not found: {0}")]
    DeliveryNotFound(String),
    #[error("dead letter entry not found: {0}")]
    DlqNotFound(String),

    #[error("event type is deprecated: {0}")]
    EventTypeDeprecated(String),
    #[error("payload validation failed: {0}")]
    PayloadValidation(String),
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("endpoint is disabled: {0}")]
    EndpointDisabled(String),

    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid id: {0}")]
    InvalidId(String),
}

impl Error {
    /// Whether this error is an entity lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EndpointNotFound(_)
                | Error::EventTypeNotFound(_)
                | Error::EventNotFound(_)
                | Error::DeliveryNotFound(_)
                | Error::DlqNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::EndpointNotFound("ep_x".into()).is_not_found());
        assert!(Error::EventTypeNotFound("order.created".into()).is_not_found());
        assert!(!Error::Validation("missing url".into()).is_not_found());
        assert!(!Error::StoreClosed.is_not_found());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::DuplicateIdempotencyKey("k1".into());
        assert!(err.to_string().contains("k1"));
    }
}
