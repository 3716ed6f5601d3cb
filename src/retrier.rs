//! Retry decision matrix and backoff computation
//!
//! A pure function from (attempt outcome, delivery state) to what happens
//! next. Status classes drive the decision: 2xx delivers, 410 disables the
//! endpoint, 429 and 5xx (and transport failures) retry within the attempt
//! budget, other 4xx dead-letter immediately.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::traits::AttemptResult;
use crate::types::Delivery;

/// What the engine should do with a delivery after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Delivered,
    Retry,
    DeadLetter,
    DisableEndpoint,
}

/// Retry policy: attempt budget plus the backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub schedule: Vec<std::time::Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, schedule: Vec<std::time::Duration>) -> Self {
        RetryPolicy {
            max_attempts,
            schedule,
        }
    }

    /// Classify an attempt outcome. Evaluated in order; success is terminal
    /// even when the attempt budget is already spent.
    pub fn decide(&self, result: &AttemptResult, delivery: &Delivery) -> Decision {
        let code = result.status_code;
        if (200..300).contains(&code) {
            return Decision::Delivered;
        }
        if code == 410 {
            return Decision::DisableEndpoint;
        }
        if code == 429 {
            return self.retry_or_dead_letter(delivery);
        }
        if (400..500).contains(&code) {
            // Other 4xx will not self-correct; do not burn attempts on them.
            return Decision::DeadLetter;
        }
        // 5xx and transport failures (code 0)
        self.retry_or_dead_letter(delivery)
    }

    fn retry_or_dead_letter(&self, delivery: &Delivery) -> Decision {
        if delivery.attempt_count < delivery.max_attempts {
            Decision::Retry
        } else {
            Decision::DeadLetter
        }
    }

    /// Next attempt timestamp for the given attempt count, clamped into the
    /// schedule. The last interval is reused for any further attempts.
    pub fn next_attempt_at(&self, attempt_count: u32) -> DateTime<Utc> {
        let index = (attempt_count.max(1) as usize - 1).min(self.schedule.len().saturating_sub(1));
        let delay = self
            .schedule
            .get(index)
            .copied()
            .unwrap_or(std::time::Duration::ZERO);
        Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero())
    }
}
