//! Reliable delivery layer.
//!
//! Every delivery taken from a queue goes through `process_delivery`:
//! the handler is invoked with bounded retry and backoff, then the message
//! is either acked or rejected into the dead-letter exchange with failure
//! headers. Handlers never settle messages themselves.
//!
//! Fair dispatch comes from the broker side: each consumer holds at most one
//! unsettled delivery (prefetch 1) and processes it to completion, including
//! backoff sleeps, before fetching the next.

mod retry;

#[cfg(test)]
mod tests;

pub use retry::{PolicyBackoff, RetryPolicy};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, error, warn, Instrument};

use crate::bus::{Delivery, HandlerError, MessageHandler};
use crate::dlq::DeadLetterInfo;

/// Per-consumer delivery counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    handler_failures: AtomicU64,
    outstanding: AtomicU64,
    max_outstanding: AtomicU64,
}

/// Point-in-time copy of `ConsumerStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub handler_failures: u64,
    pub outstanding: u64,
    pub max_outstanding: u64,
}

impl ConsumerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            handler_failures: self.handler_failures.load(Ordering::SeqCst),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            max_outstanding: self.max_outstanding.load(Ordering::SeqCst),
        }
    }

    fn begin(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked { attempts: u32 },
    DeadLettered { attempts: u32 },
}

/// Run `handler` on one delivery and settle it.
///
/// The handler is invoked at most `policy.attempts()` times. On success the
/// message is acked; after the last failure it is rejected without requeue
/// carrying `DeadLetterInfo` headers, so exactly one dead-letter entry is
/// produced. Settlement errors are logged; the broker then redelivers.
pub async fn process_delivery(
    queue: &str,
    delivery: Delivery,
    handler: &dyn MessageHandler,
    policy: RetryPolicy,
    stats: &ConsumerStats,
) -> DeliveryOutcome {
    let span = tracing::info_span!(
        "delivery",
        queue = %queue,
        routing_key = %delivery.message.routing_key,
        redelivered = delivery.message.redelivered,
    );
    settle(delivery, handler, policy, stats)
        .instrument(span)
        .await
}

async fn settle(
    delivery: Delivery,
    handler: &dyn MessageHandler,
    policy: RetryPolicy,
    stats: &ConsumerStats,
) -> DeliveryOutcome {
    stats.begin();

    let Delivery { message, acker } = delivery;
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.attempts();

    let result = (|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        handler.handle(Arc::clone(&message))
    })
    .retry(policy)
    .notify(|err: &HandlerError, delay: Duration| {
        stats.handler_failures.fetch_add(1, Ordering::SeqCst);
        warn!(
            attempt = attempts.load(Ordering::SeqCst),
            max_attempts,
            error = %err,
            delay = ?delay,
            "Handler failed, retrying"
        );
    })
    .await;

    let attempts = attempts.into_inner();

    let outcome = match result {
        Ok(()) => {
            debug!(attempts, "Message handled");
            if let Err(e) = acker.ack().await {
                error!(error = %e, "Failed to ack message");
            } else {
                stats.acked.fetch_add(1, Ordering::SeqCst);
            }
            DeliveryOutcome::Acked { attempts }
        }
        Err(e) => {
            stats.handler_failures.fetch_add(1, Ordering::SeqCst);
            let info = DeadLetterInfo::for_message(&message, e.to_string(), attempts);
            error!(
                attempts,
                error = %e,
                "Handler failed permanently, dead-lettering message"
            );
            if let Err(e) = acker.reject(info.annotate(&message)).await {
                error!(error = %e, "Failed to dead-letter message");
            } else {
                stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
            }
            DeliveryOutcome::DeadLettered { attempts }
        }
    };

    stats.finish();
    outcome
}
