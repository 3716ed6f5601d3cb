//! Delivery engine: single poller, bounded worker pool
//!
//! The poll loop claims a batch from the store every `poll_interval` and
//! hands each delivery to a worker task. A semaphore of `concurrency`
//! permits caps in-flight workers; `stop` signals the poller and then waits
//! until every permit is back, so in-flight attempts always finish their
//! write-back. The engine never surfaces errors to callers — failures are
//! logged and the queue reconsiders the delivery on a later poll.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RelayConfig;
use crate::dlq::DlqService;
use crate::rate_limit::RateLimiter;
use crate::retrier::{Decision, RetryPolicy};
use crate::traits::{DeliverySender, DeliveryStore, EndpointStore, EventStore, Store};
use crate::types::{Delivery, DeliveryState};

/// Claims older than this are treated as crashed workers on startup.
const STALE_CLAIM_HORIZON_SECS: i64 = 300;

/// How long a rate-limited delivery is pushed back before the next try.
const THROTTLE_DELAY_SECS: i64 = 1;

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) sender: Arc<dyn DeliverySender>,
    pub(crate) policy: RetryPolicy,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) dlq: DlqService,
}

/// Poller plus worker pool over a store and a sender.
pub struct DeliveryEngine {
    ctx: WorkerContext,
    poll_interval: Duration,
    batch_size: usize,
    concurrency: usize,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn DeliverySender>,
        config: &RelayConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        DeliveryEngine {
            ctx: WorkerContext {
                store: Arc::clone(&store),
                sender,
                policy: RetryPolicy::new(config.max_attempts, config.backoff.clone()),
                limiter: Arc::new(RateLimiter::new()),
                dlq: DlqService::new(store),
            },
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            concurrency: config.concurrency,
            slots: Arc::new(Semaphore::new(config.concurrency)),
            shutdown_tx,
            poller: StdMutex::new(None),
        }
    }

    /// Launch the poll loop. Idempotent while running.
    pub fn start(&self) {
        let mut poller = self.poller.lock().unwrap();
        if poller.is_some() {
            tracing::warn!("delivery engine already running");
            return;
        }

        // Claims left behind by a previous crash become claimable again.
        match self
            .ctx
            .store
            .recover_stale(ChronoDuration::seconds(STALE_CLAIM_HORIZON_SECS))
        {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "requeued stale deliveries on startup"),
            Err(e) => tracing::error!(error = %e, "stale claim recovery failed"),
        }

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let ctx = self.ctx.clone();
        let slots = Arc::clone(&self.slots);
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;

        let handle = tokio::spawn(async move {
            tracing::info!(
                poll_ms = poll_interval.as_millis() as u64,
                batch_size,
                "delivery engine started"
            );
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            'poll: loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'poll,
                    _ = interval.tick() => {}
                }

                let batch = match ctx.store.dequeue(batch_size) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to claim delivery batch");
                        continue;
                    }
                };

                for delivery in batch {
                    let permit = tokio::select! {
                        _ = shutdown_rx.changed() => break 'poll,
                        permit = Arc::clone(&slots).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break 'poll,
                        },
                    };
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process(&ctx, delivery).await;
                    });
                }
            }
            tracing::info!("delivery engine poll loop stopped");
        });
        *poller = Some(handle);
    }

    /// Signal shutdown and wait for the poller and all in-flight workers.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.poller.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "poll loop task panicked");
            }
        }

        // Every worker holds one permit; having them all back means drained.
        match self.slots.acquire_many(self.concurrency as u32).await {
            Ok(_permits) => {}
            Err(_) => tracing::error!("worker pool semaphore closed during drain"),
        }
        tracing::info!("delivery engine stopped");
    }
}

/// Run one claimed delivery to its next state.
pub(crate) async fn process(ctx: &WorkerContext, mut delivery: Delivery) {
    let endpoint = match ctx.store.get_endpoint(&delivery.endpoint_id) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(delivery = %delivery.id, error = %e, "endpoint fetch failed");
            reschedule_after_fetch_failure(ctx, delivery);
            return;
        }
    };
    let event = match ctx.store.get_event(&delivery.event_id) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(delivery = %delivery.id, error = %e, "event fetch failed");
            reschedule_after_fetch_failure(ctx, delivery);
            return;
        }
    };

    if let Some(rate) = endpoint.rate_limit {
        if rate > 0 && !ctx.limiter.try_acquire(&endpoint.id, rate) {
            delivery.state = DeliveryState::Pending;
            delivery.next_attempt_at = Utc::now() + ChronoDuration::seconds(THROTTLE_DELAY_SECS);
            if let Err(e) = ctx.store.update_delivery(delivery.clone()) {
                tracing::error!(delivery = %delivery.id, error = %e, "throttle reschedule failed");
            }
            tracing::debug!(delivery = %delivery.id, endpoint = %endpoint.id, "delivery throttled");
            return;
        }
    }

    delivery.attempt_count += 1;
    let result = ctx.sender.send(&endpoint, &event, &delivery).await;

    delivery.last_status_code = (result.status_code != 0).then_some(result.status_code);
    delivery.last_response = result.response.clone();
    delivery.last_latency_ms = Some(result.latency_ms);
    delivery.last_error = result.error.clone().or_else(|| {
        (!result.is_success()).then(|| format!("HTTP {}", result.status_code))
    });

    let now = Utc::now();
    match ctx.policy.decide(&result, &delivery) {
        Decision::Delivered => {
            delivery.state = DeliveryState::Delivered;
            delivery.last_error = None;
            delivery.completed_at = Some(now);
            tracing::info!(
                delivery = %delivery.id,
                endpoint = %endpoint.id,
                attempt = delivery.attempt_count,
                latency_ms = result.latency_ms,
                "delivery succeeded"
            );
        }
        Decision::Retry => {
            delivery.state = DeliveryState::Pending;
            delivery.next_attempt_at = ctx.policy.next_attempt_at(delivery.attempt_count);
            tracing::warn!(
                delivery = %delivery.id,
                endpoint = %endpoint.id,
                attempt = delivery.attempt_count,
                max_attempts = delivery.max_attempts,
                status = result.status_code,
                "delivery attempt failed, retry scheduled"
            );
        }
        Decision::DeadLetter => {
            delivery.state = DeliveryState::Failed;
            delivery.completed_at = Some(now);
            if let Err(e) = ctx.dlq.push_failed(&delivery, &endpoint, &event) {
                tracing::error!(delivery = %delivery.id, error = %e, "dead letter push failed");
            }
        }
        Decision::DisableEndpoint => {
            delivery.state = DeliveryState::Failed;
            delivery.completed_at = Some(now);
            if let Err(e) = ctx.store.set_endpoint_enabled(&endpoint.id, false) {
                tracing::error!(endpoint = %endpoint.id, error = %e, "endpoint disable failed");
            } else {
                tracing::warn!(endpoint = %endpoint.id, "endpoint disabled after 410 Gone");
            }
            if let Err(e) = ctx.dlq.push_failed(&delivery, &endpoint, &event) {
                tracing::error!(delivery = %delivery.id, error = %e, "dead letter push failed");
            }
        }
    }

    if let Err(e) = ctx.store.update_delivery(delivery.clone()) {
        tracing::error!(delivery = %delivery.id, error = %e, "delivery write-back failed");
    }
}

/// A delivery whose endpoint or event cannot be loaded goes back to pending
/// with backoff rather than sitting in the delivering state forever.
fn reschedule_after_fetch_failure(ctx: &WorkerContext, mut delivery: Delivery) {
    delivery.state = DeliveryState::Pending;
    delivery.next_attempt_at = ctx.policy.next_attempt_at(delivery.attempt_count.max(1));
    if let Err(e) = ctx.store.update_delivery(delivery.clone()) {
        tracing::error!(delivery = %delivery.id, error = %e, "fetch-failure reschedule failed");
    }
}
