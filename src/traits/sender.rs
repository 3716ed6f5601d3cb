//! Outbound HTTP sender trait
//!
//! The sender never fails: transport errors, timeouts and HTTP error
//! statuses are all encoded in the [`AttemptResult`], which the retrier
//! turns into a decision.

use serde::{Deserialize, Serialize};

use crate::types::{Delivery, Endpoint, Event};

/// Outcome of a single delivery attempt.
///
/// `status_code == 0` means no HTTP response was received (transport error,
/// timeout, or cancellation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptResult {
    pub status_code: u16,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    pub latency_ms: u64,
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Trait for outbound webhook delivery.
///
/// Production: reqwest HTTP client.
/// Testing: recorded responses.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DeliverySender: Send + Sync {
    /// Sign and POST the event payload to the endpoint.
    async fn send(&self, endpoint: &Endpoint, event: &Event, delivery: &Delivery)
        -> AttemptResult;

    /// Connectivity probe: POST a minimal payload to a URL.
    async fn probe(&self, url: &str) -> AttemptResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_classification() {
        assert!(AttemptResult { status_code: 200, ..Default::default() }.is_success());
        assert!(AttemptResult { status_code: 299, ..Default::default() }.is_success());
        assert!(!AttemptResult { status_code: 300, ..Default::default() }.is_success());
        assert!(!AttemptResult { status_code: 0, ..Default::default() }.is_success());
        assert!(!AttemptResult { status_code: 500, ..Default::default() }.is_success());
    }
}
