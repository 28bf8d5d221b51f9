//! ridewire: dispatch host
//!
//! Runs the choreography participants in one process:
//! - dispatch saga (driver lookup, driver responses, payment success)
//! - payment collaborator
//! - gateway relay for rider and driver notifications
//! - dead-letter inspector
//!
//! ## Configuration
//! - `--config <path>` or RIDEWIRE_CONFIG: YAML config file
//! - RIDEWIRE__MESSAGING__TYPE: `channel` (default) or `amqp`
//! - RIDEWIRE__MESSAGING__AMQP__URL: broker URL
//! - RIDEWIRE_LOG: tracing filter (default: info)

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use ridewire::bus::{declare_topology, ConsumerHandle};
use ridewire::config::Config;
use ridewire::contracts::DEAD_LETTER_QUEUE;
use ridewire::delivery::RetryPolicy;
use ridewire::dispatch::DispatchSaga;
use ridewire::dlq::{DeadLetterEntry, DeadLetterInspector};
use ridewire::drivers::InMemoryDriverRegistry;
use ridewire::gateway::{GatewayRelay, TracingGateway};
use ridewire::payment::{InMemoryPaymentProcessor, PaymentConsumer};
use ridewire::trip::InMemoryTripRepository;
use ridewire::utils::bootstrap::{connect_bus_with_retry, init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        messaging_type = ?config.messaging.messaging_type,
        max_attempts = config.retry.max_attempts,
        "Starting ridewire"
    );

    let bus = connect_bus_with_retry(&config.messaging, config.retry.policy())
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    declare_topology(bus.as_ref()).await.map_err(|e| {
        error!("Failed to declare topology: {}", e);
        e
    })?;

    let mut handles: Vec<ConsumerHandle> = Vec::new();

    let saga = Arc::new(DispatchSaga::new(
        Arc::new(InMemoryTripRepository::new()),
        Arc::new(InMemoryDriverRegistry::new()),
        Arc::clone(&bus),
    ));
    handles.extend(saga.start().await?);

    let payments = Arc::new(PaymentConsumer::new(
        Arc::new(InMemoryPaymentProcessor::new()),
        Arc::clone(&bus),
    ));
    handles.push(payments.start().await?);

    let relay = Arc::new(GatewayRelay::new(Arc::new(TracingGateway), Arc::clone(&bus)));
    handles.extend(relay.start().await?);

    let (inspector, dead_letters) = DeadLetterInspector::new();
    handles.push(
        bus.subscribe_with_policy(DEAD_LETTER_QUEUE, Arc::new(inspector), RetryPolicy::no_retry())
            .await?,
    );
    tokio::spawn(count_dead_letters(dead_letters));

    info!(consumers = handles.len(), "ridewire running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let deadline = config.shutdown.timeout();
    for handle in handles {
        let queue = handle.queue().to_string();
        let stats = handle.stats().snapshot();
        if !handle.shutdown(deadline).await {
            warn!(queue = %queue, "Consumer abandoned at shutdown");
        }
        info!(
            queue = %queue,
            delivered = stats.delivered,
            acked = stats.acked,
            dead_lettered = stats.dead_lettered,
            "Consumer summary"
        );
    }

    bus.close().await?;
    info!("ridewire stopped");
    Ok(())
}

async fn count_dead_letters(mut entries: mpsc::UnboundedReceiver<DeadLetterEntry>) {
    let mut total = 0u64;
    while let Some(entry) = entries.recv().await {
        total += 1;
        info!(
            total,
            routing_key = %entry.info.original_routing_key,
            "Dead letters seen since start"
        );
    }
}
