//! Per-endpoint token buckets for outbound request pacing
//!
//! Buckets are created lazily, refill proportionally to elapsed wall time,
//! and cap at the configured per-second rate (burst = rate). The limiter is
//! advisory: a denied acquire reschedules the delivery, it never drops it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::id::Id;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: u32) -> Self {
        Bucket {
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, rate: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Lazily-populated token buckets keyed by endpoint id.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<Id, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token from the endpoint's bucket. A zero rate always denies.
    pub fn try_acquire(&self, endpoint_id: &Id, rate: u32) -> bool {
        if rate == 0 {
            return false;
        }
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(endpoint_id.clone())
            .or_insert_with(|| Bucket::new(rate))
            .try_take(rate)
    }

    /// Drop the bucket for an endpoint, e.g. after its rate limit changes.
    pub fn forget(&self, endpoint_id: &Id) {
        self.buckets.lock().unwrap().remove(endpoint_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdKind;

    #[test]
    fn test_burst_up_to_rate() {
        let limiter = RateLimiter::new();
        let ep = Id::generate(IdKind::Endpoint);
        for _ in 0..3 {
            assert!(limiter.try_acquire(&ep, 3));
        }
        assert!(!limiter.try_acquire(&ep, 3));
    }

    #[test]
    fn test_refills_over_time() {
        let limiter = RateLimiter::new();
        let ep = Id::generate(IdKind::Endpoint);
        // Drain a high-rate bucket, then wait for a partial refill.
        for _ in 0..100 {
            assert!(limiter.try_acquire(&ep, 100));
        }
        assert!(!limiter.try_acquire(&ep, 100));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(limiter.try_acquire(&ep, 100));
    }

    #[test]
    fn test_independent_buckets() {
        let limiter = RateLimiter::new();
        let a = Id::generate(IdKind::Endpoint);
        let b = Id::generate(IdKind::Endpoint);
        assert!(limiter.try_acquire(&a, 1));
        assert!(!limiter.try_acquire(&a, 1));
        assert!(limiter.try_acquire(&b, 1));
    }

    #[test]
    fn test_zero_rate_always_denies() {
        let limiter = RateLimiter::new();
        let ep = Id::generate(IdKind::Endpoint);
        assert!(!limiter.try_acquire(&ep, 0));
    }

    #[test]
    fn test_forget_resets_bucket() {
        let limiter = RateLimiter::new();
        let ep = Id::generate(IdKind::Endpoint);
        assert!(limiter.try_acquire(&ep, 1));
        assert!(!limiter.try_acquire(&ep, 1));
        limiter.forget(&ep);
        assert!(limiter.try_acquire(&ep, 1));
    }
}
