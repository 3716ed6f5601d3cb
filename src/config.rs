//! Engine tuning knobs and the retry backoff schedule

use std::time::Duration;

/// Configuration for the relay engine.
///
/// The backoff schedule applies per retry attempt; the last interval is
/// reused for any attempts beyond its length.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on concurrently executing delivery workers.
    pub concurrency: usize,
    /// How often the poll loop claims a new batch.
    pub poll_interval: Duration,
    /// Maximum deliveries claimed per poll.
    pub batch_size: usize,
    /// Attempt budget per delivery before it dead-letters.
    pub max_attempts: u32,
    /// Per-request deadline for outbound HTTP.
    pub request_timeout: Duration,
    /// Retry backoff schedule, indexed by attempt count.
    pub backoff: Vec<Duration>,
    /// TTL for the catalog read cache. Zero means entries never expire.
    pub cache_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            batch_size: 20,
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(2 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(2 * 60 * 60),
            ],
            cache_ttl: Duration::from_secs(60),
        }
    }
}
