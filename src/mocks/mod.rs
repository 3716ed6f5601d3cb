//! Test doubles for dependency injection
//!
//! Provides a recording sender with scripted behaviors for isolated testing
//! of the engine and the full pipeline. The in-memory store double is the
//! real [`MemoryStore`](crate::memory::MemoryStore).

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::traits::{AttemptResult, DeliverySender};
use crate::types::{Delivery, Endpoint, Event};

/// A request observed by the recorded sender.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub url: String,
    pub event_id: String,
    pub delivery_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Scripted response behavior for [`RecordedSender`].
#[derive(Debug, Clone)]
pub enum SendBehavior {
    /// Always respond with the given HTTP status.
    AlwaysStatus(u16),
    /// Respond with each status in order; the last repeats forever.
    StatusSequence(Vec<u16>),
    /// Always fail at the transport layer (status 0).
    TransportError(String),
    /// Fail at the transport layer N times, then respond 200.
    FailThenSucceed { fail_count: usize },
}

/// Recording sender for tests: captures every request and answers from a
/// scripted behavior.
#[derive(Clone)]
pub struct RecordedSender {
    requests: Arc<Mutex<Vec<SentRequest>>>,
    behavior: Arc<Mutex<SendBehavior>>,
    call_count: Arc<Mutex<usize>>,
}

impl RecordedSender {
    pub fn new(behavior: SendBehavior) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(behavior)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Always respond 200 OK.
    pub fn success() -> Self {
        Self::new(SendBehavior::AlwaysStatus(200))
    }

    /// Always respond with the given status.
    pub fn status(code: u16) -> Self {
        Self::new(SendBehavior::AlwaysStatus(code))
    }

    /// Respond with each status in order; the last repeats.
    pub fn sequence(codes: Vec<u16>) -> Self {
        Self::new(SendBehavior::StatusSequence(codes))
    }

    /// Always fail at the transport layer.
    pub fn transport_error(message: &str) -> Self {
        Self::new(SendBehavior::TransportError(message.to_string()))
    }

    pub fn set_behavior(&self, behavior: SendBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn requests(&self) -> Vec<SentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
        *self.call_count.lock().unwrap() = 0;
    }

    fn respond(&self, request: SentRequest) -> AttemptResult {
        self.requests.lock().unwrap().push(request);

        let mut count = self.call_count.lock().unwrap();
        *count += 1;
        let current = *count;
        drop(count);

        let behavior = self.behavior.lock().unwrap().clone();
        let result = match behavior {
            SendBehavior::AlwaysStatus(code) => status_result(code),
            SendBehavior::StatusSequence(codes) => {
                let code = codes
                    .get(current - 1)
                    .or_else(|| codes.last())
                    .copied()
                    .unwrap_or(200);
                status_result(code)
            }
            SendBehavior::TransportError(message) => AttemptResult {
                status_code: 0,
                error: Some(message),
                response: None,
                latency_ms: 3,
            },
            SendBehavior::FailThenSucceed { fail_count } => {
                if current <= fail_count {
                    AttemptResult {
                        status_code: 0,
                        error: Some("connection refused".to_string()),
                        response: None,
                        latency_ms: 3,
                    }
                } else {
                    status_result(200)
                }
            }
        };
        result
    }
}

fn status_result(code: u16) -> AttemptResult {
    AttemptResult {
        status_code: code,
        error: None,
        response: Some("OK".to_string()),
        latency_ms: 5,
    }
}

#[async_trait::async_trait]
impl DeliverySender for RecordedSender {
    async fn send(&self, endpoint: &Endpoint, event: &Event, delivery: &Delivery) -> AttemptResult {
        self.respond(SentRequest {
            url: endpoint.url.clone(),
            event_id: event.id.to_string(),
            delivery_id: delivery.id.to_string(),
            event_type: event.event_type.clone(),
            payload: event.data.clone(),
        })
    }

    async fn probe(&self, url: &str) -> AttemptResult {
        self.respond(SentRequest {
            url: url.to_string(),
            event_id: String::new(),
            delivery_id: String::new(),
            event_type: String::new(),
            payload: Value::Null,
        })
    }
}
