//! Relay - embeddable webhook delivery engine with guaranteed delivery
//!
//! Accepts tenant-scoped events, fans them out to subscribed HTTP endpoints,
//! signs each request, and guarantees at-least-once delivery with bounded
//! retries, endpoint protection and a dead letter queue. The store contract
//! is the single pluggable seam; in-memory and SQLite backends ship in the
//! crate.

pub mod catalog;
pub mod config;
pub mod dlq;
pub mod endpoints;
pub mod engine;
pub mod error;
pub mod id;
pub mod memory;
pub mod mocks;
pub mod pattern;
pub mod production;
pub mod rate_limit;
pub mod retrier;
pub mod schema;
pub mod signer;
pub mod sqlite;
pub mod traits;
pub mod types;

mod relay;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use id::{Id, IdKind};
pub use memory::MemoryStore;
pub use relay::{NoopScopeCapture, Relay, ScopeCapture};
pub use sqlite::SqliteStore;

/// Initialize logging for binaries embedding the engine. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
