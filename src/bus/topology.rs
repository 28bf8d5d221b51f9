//! Startup declaration of exchanges, queues and bindings.

use tracing::info;

use super::{MessageBus, QueueSpec, Result};
use crate::contracts::{DEAD_LETTER_EXCHANGE, QUEUE_BINDINGS, TRIP_EXCHANGE};

/// Every queue of the system, bound to the trip exchange.
pub fn work_queues() -> Vec<QueueSpec> {
    QUEUE_BINDINGS
        .iter()
        .map(|(queue, keys)| QueueSpec::bound(queue, TRIP_EXCHANGE, keys))
        .collect()
}

/// Declare the dead-letter exchange and queue first, then the trip exchange
/// and its work queues. Idempotent; any error should abort startup.
pub async fn declare_topology(bus: &dyn MessageBus) -> Result<()> {
    bus.declare_exchange(DEAD_LETTER_EXCHANGE).await?;
    bus.declare_queue(&QueueSpec::dead_letter()).await?;

    bus.declare_exchange(TRIP_EXCHANGE).await?;
    let queues = work_queues();
    for spec in &queues {
        bus.declare_queue(spec).await?;
    }

    info!(queues = queues.len(), "Message topology declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::contracts::{DEAD_LETTER_QUEUE, DRIVER_TRIP_RESPONSE_QUEUE};

    #[tokio::test]
    async fn test_declares_dead_letter_before_work_queues() {
        let bus = MockBus::new();
        declare_topology(&bus).await.unwrap();

        assert_eq!(bus.declared_exchanges().await, vec!["dlx", "trip"]);

        let queues = bus.declared_queues().await;
        assert_eq!(queues.len(), 9);
        assert_eq!(queues[0].name, DEAD_LETTER_QUEUE);
        assert!(queues[1..]
            .iter()
            .all(|q| q.dead_letter_exchange.as_deref() == Some(DEAD_LETTER_EXCHANGE)));
    }

    #[tokio::test]
    async fn test_declare_topology_twice_is_harmless() {
        let bus = MockBus::new();
        declare_topology(&bus).await.unwrap();
        declare_topology(&bus).await.unwrap();
        assert_eq!(bus.declared_queues().await.len(), 9);
    }

    #[test]
    fn test_driver_response_queue_fans_in_two_keys() {
        let spec = work_queues()
            .into_iter()
            .find(|q| q.name == DRIVER_TRIP_RESPONSE_QUEUE)
            .unwrap();
        assert_eq!(
            spec.routing_keys,
            vec!["driver-cmd-trip-accept", "driver-cmd-trip-decline"]
        );
    }
}
