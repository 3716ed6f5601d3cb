//! Reqwest-based webhook sender
//!
//! Builds the outbound request: JSON body, identity headers, signature pair,
//! then endpoint-configured custom headers, which may override anything
//! before them. Failures never propagate as errors — the attempt result
//! carries the status (0 for transport failures) and the retrier decides.

use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::error::{Error, Result};
use crate::signer;
use crate::traits::{AttemptResult, DeliverySender};
use crate::types::{clip_response, Delivery, Endpoint, Event, MAX_RESPONSE_BYTES};

const USER_AGENT: &str = "Relay/1.0";

/// HTTP sender with one long-lived client and a per-request deadline.
pub struct HttpSender {
    client: Client,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Receivers expect strict POST semantics, so never follow redirects.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Validation(format!("failed to build http client: {e}")))?;
        Ok(Self { client, timeout })
    }

    async fn post(&self, url: &str, headers: HeaderMap, body: Vec<u8>) -> AttemptResult {
        let start = Instant::now();

        let response = self
            .client
            .post(url)
            .headers(headers)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let error = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                };
                tracing::warn!(url = %url, error = %error, latency_ms, "webhook transport failure");
                return AttemptResult {
                    status_code: 0,
                    error: Some(error),
                    response: None,
                    latency_ms,
                };
            }
        };

        let status_code = response.status().as_u16();

        // Read at most the persisted cap; drop the rest of the body.
        let mut buf: Vec<u8> = Vec::new();
        let mut read_error = None;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    if buf.len() >= MAX_RESPONSE_BYTES {
                        buf.truncate(MAX_RESPONSE_BYTES);
                        break;
                    }
                }
                Err(e) => {
                    read_error = Some(e.to_string());
                    break;
                }
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let body = if buf.is_empty() || read_error.is_some() {
            None
        } else {
            Some(clip_response(&String::from_utf8_lossy(&buf)))
        };

        tracing::debug!(url = %url, status = status_code, latency_ms, "webhook response");
        AttemptResult {
            status_code,
            error: read_error,
            response: body,
            latency_ms,
        }
    }
}

#[async_trait::async_trait]
impl DeliverySender for HttpSender {
    async fn send(&self, endpoint: &Endpoint, event: &Event, delivery: &Delivery) -> AttemptResult {
        let body = match serde_json::to_vec(&event.data) {
            Ok(b) => b,
            Err(e) => {
                return AttemptResult {
                    status_code: 0,
                    error: Some(format!("unserializable payload: {e}")),
                    response: None,
                    latency_ms: 0,
                }
            }
        };

        let timestamp = chrono::Utc::now().timestamp();
        let signature = signer::sign(&body, &endpoint.secret, timestamp);
        let headers = build_headers(endpoint, event, delivery, timestamp, &signature);

        self.post(&endpoint.url, headers, body).await
    }

    async fn probe(&self, url: &str) -> AttemptResult {
        let payload = serde_json::json!({
            "probe": true,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let body = payload.to_string().into_bytes();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
        self.post(url, headers, body).await
    }
}

fn build_headers(
    endpoint: &Endpoint,
    event: &Event,
    delivery: &Delivery,
    timestamp: i64,
    signature: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    insert_header(&mut headers, "x-relay-event-id", event.id.as_str());
    insert_header(&mut headers, "x-relay-event-type", &event.event_type);
    insert_header(&mut headers, "x-relay-delivery-id", delivery.id.as_str());
    insert_header(&mut headers, "x-relay-timestamp", &timestamp.to_string());
    insert_header(&mut headers, "x-relay-signature", signature);

    // Endpoint-configured headers come last and replace anything above.
    for (name, value) in &endpoint.headers {
        match (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => {
                tracing::warn!(endpoint = %endpoint.id, header = %name, "skipping invalid custom header");
            }
        }
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
