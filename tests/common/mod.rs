//! Shared utilities for integration tests.
//!
//! Builds an in-process broker with the full topology and a tap queue that
//! records every event published on the trip exchange.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use ridewire::bus::{declare_topology, ChannelBus, Message, MessageBus, QueueSpec};
use ridewire::contracts::{CATCH_ALL_PATTERN, TRIP_EXCHANGE};
use ridewire::delivery::RetryPolicy;

/// Queue bound to every routing key, never consumed.
pub const TAP_QUEUE: &str = "test-tap";

/// How long a test waits for the choreography to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Millisecond-scale policy so retry tests finish quickly.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(5),
        Duration::from_millis(20),
    )
}

/// Channel bus with the trip topology and the tap queue declared.
pub async fn topology_bus(policy: RetryPolicy) -> ChannelBus {
    let bus = ChannelBus::with_retry_policy(policy);
    declare_topology(&bus).await.expect("topology");
    bus.declare_queue(&QueueSpec::bound(
        TAP_QUEUE,
        TRIP_EXCHANGE,
        &[CATCH_ALL_PATTERN],
    ))
    .await
    .expect("tap queue");
    bus
}

/// Poll `condition` until it holds or `SETTLE_TIMEOUT` elapses.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Everything published since the last call, as (routing key, owner id).
pub async fn drain_tap(bus: &ChannelBus) -> Vec<(String, String)> {
    bus.drain_queue(TAP_QUEUE)
        .await
        .expect("tap queue")
        .into_iter()
        .map(|m: Message| {
            let owner = m.envelope().map(|e| e.owner_id).unwrap_or_default();
            (m.routing_key, owner)
        })
        .collect()
}

/// Published events with `routing_key`, by owner.
pub fn owners_of(tap: &[(String, String)], routing_key: &str) -> Vec<String> {
    tap.iter()
        .filter(|(key, _)| key == routing_key)
        .map(|(_, owner)| owner.clone())
        .collect()
}
