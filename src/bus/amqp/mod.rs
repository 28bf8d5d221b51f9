//! AMQP (RabbitMQ) message bus implementation.
//!
//! Publishes to the `trip` topic exchange; every queue carries
//! `x-dead-letter-exchange = dlx`. Consumers run on their own channel with
//! prefetch 1 and manual acknowledgement, and reconnect with backoff when the
//! delivery stream ends.
//!
//! A broker-side reject cannot carry new headers, so permanently failed
//! deliveries are re-published to the dead-letter exchange with the original
//! routing key and the failure headers, then acked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    wait_for_shutdown, Acknowledger, BusError, ConsumerHandle, Delivery, HeaderValue, Headers,
    Message, MessageBus, MessageHandler, QueueSpec, Result,
};
use crate::contracts::{Envelope, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, TRIP_EXCHANGE};
use crate::delivery::{process_delivery, ConsumerStats, RetryPolicy};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEFAULT_POOL_SIZE: usize = 10;

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpBusConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Exchange name for publishing.
    pub exchange: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl AmqpBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: TRIP_EXCHANGE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }
}

// ============================================================================
// Header conversion
// ============================================================================

fn headers_from_amqp(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let converted = match value {
            AMQPValue::LongString(s) => {
                HeaderValue::Text(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(s) => HeaderValue::Text(s.as_str().to_string()),
            AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
            AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), converted);
    }
    headers
}

/// `headers` written over `table`. Entries `Headers` cannot represent
/// (booleans, tables, timestamps) are kept as the broker sent them.
fn overlay_headers(mut table: FieldTable, headers: &Headers) -> FieldTable {
    for (key, value) in headers {
        let converted = match value {
            HeaderValue::Text(s) => AMQPValue::LongString(s.clone().into()),
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
        };
        table.insert(key.clone().into(), converted);
    }
    table
}

fn persistent_properties(headers: FieldTable) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2); // persistent

    if headers.inner().is_empty() {
        properties
    } else {
        properties.with_headers(headers)
    }
}

// ============================================================================
// Publishing
// ============================================================================

/// Lazily created, confirm-enabled channel shared by all publishers.
struct Publisher {
    pool: Pool,
    channel: Mutex<Option<Channel>>,
}

impl Publisher {
    async fn channel(&self) -> Result<Channel> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = open_channel(&self.pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn invalidate(&self) {
        *self.channel.lock().await = None;
    }

    /// Single publish attempt with broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: FieldTable,
        body: &[u8],
    ) -> Result<()> {
        let channel = self.channel().await?;

        let outcome = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                persistent_properties(headers),
            )
            .await
        {
            Ok(confirm) => match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => Err(BusError::Publish(
                    "Broker refused the message".to_string(),
                )),
                Ok(_) => Ok(()),
                Err(e) => Err(BusError::Publish(format!(
                    "Publish confirmation failed: {}",
                    e
                ))),
            },
            Err(e) => Err(BusError::Publish(format!("Failed to publish: {}", e))),
        };

        if outcome.is_err() {
            // Next publish gets a fresh channel.
            self.invalidate().await;
        }
        outcome
    }
}

async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

// ============================================================================
// Acknowledgement
// ============================================================================

struct AmqpAcker {
    acker: Acker,
    publisher: Arc<Publisher>,
    dead_letter_exchange: Option<String>,
    /// Headers exactly as delivered.
    original_headers: FieldTable,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, message: Message) -> Result<()> {
        let Some(dlx) = &self.dead_letter_exchange else {
            return self
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map(|_| ())
                .map_err(|e| BusError::Ack(format!("Failed to reject: {}", e)));
        };

        // On failure the original stays unacked and is redelivered.
        let headers = overlay_headers(self.original_headers.clone(), &message.headers);
        self.publisher
            .publish(dlx, &message.routing_key, headers, &message.body)
            .await?;
        self.ack().await
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Message bus backed by RabbitMQ.
pub struct AmqpBus {
    pool: Pool,
    config: AmqpBusConfig,
    publisher: Arc<Publisher>,
    retry_policy: RetryPolicy,
    /// Dead-letter exchange of each queue declared through this bus.
    queues: RwLock<HashMap<String, Option<String>>>,
}

impl AmqpBus {
    /// Create a new AMQP bus and verify the broker is reachable.
    pub async fn new(config: AmqpBusConfig, retry_policy: RetryPolicy) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            pool_size = config.pool_size,
            "Connected to AMQP"
        );

        let publisher = Arc::new(Publisher {
            pool: pool.clone(),
            channel: Mutex::new(None),
        });

        Ok(Self {
            pool,
            config,
            publisher,
            retry_policy,
            queues: RwLock::new(HashMap::new()),
        })
    }

    async fn dead_letter_exchange_for(&self, queue: &str) -> Option<String> {
        if let Some(dlx) = self.queues.read().await.get(queue) {
            return dlx.clone();
        }
        // Declared by another process; assume the standard topology.
        (queue != DEAD_LETTER_QUEUE).then(|| DEAD_LETTER_EXCHANGE.to_string())
    }

    /// Open a consumer channel with prefetch 1.
    async fn setup_consumer(pool: &Pool, queue: &str) -> Result<(Channel, lapin::Consumer)> {
        let channel = open_channel(pool).await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("ridewire-{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    #[allow(clippy::too_many_arguments)]
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        mut current: Option<(Channel, lapin::Consumer)>,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        stats: Arc<ConsumerStats>,
        acking: Arc<Publisher>,
        dead_letter_exchange: Option<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        loop {
            let (channel, mut consumer) = match current.take() {
                Some(pair) => pair,
                None => match Self::setup_consumer(&pool, &queue).await {
                    Ok(pair) => {
                        info!(queue = %queue, "Consumer reconnected");
                        // Reset backoff on successful connection
                        backoff_iter = backoff_builder.build();
                        pair
                    }
                    Err(e) => {
                        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            queue = %queue,
                            "Failed to set up consumer, retrying after backoff"
                        );
                        tokio::select! {
                            _ = wait_for_shutdown(&mut shutdown) => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                },
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => {
                        let _ = channel.close(200, "Consumer shutdown").await;
                        return;
                    }
                    next = consumer.next() => next,
                };

                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                        break;
                    }
                    None => break,
                };

                let lapin::message::Delivery {
                    exchange,
                    routing_key,
                    redelivered,
                    properties,
                    data,
                    acker,
                    ..
                } = delivery;

                let original_headers = properties.headers().clone().unwrap_or_default();
                let message = Message {
                    exchange: exchange.as_str().to_string(),
                    routing_key: routing_key.as_str().to_string(),
                    headers: headers_from_amqp(Some(&original_headers)),
                    body: data,
                    redelivered,
                };
                let acker = AmqpAcker {
                    acker,
                    publisher: Arc::clone(&acking),
                    dead_letter_exchange: dead_letter_exchange.clone(),
                    original_headers,
                };

                process_delivery(
                    &queue,
                    Delivery::new(message, Box::new(acker)),
                    handler.as_ref(),
                    policy,
                    &stats,
                )
                .await;
            }

            warn!(queue = %queue, "Consumer stream ended, reconnecting...");
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %routing_key))]
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        let body = envelope.to_bytes()?;
        self.publisher
            .publish(&self.config.exchange, routing_key, FieldTable::default(), &body)
            .await?;
        debug!(exchange = %self.config.exchange, "Published envelope");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let channel = open_channel(&self.pool).await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare exchange: {}", e)))?;
        let _ = channel.close(200, "OK").await;

        debug!(exchange = %name, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let channel = open_channel(&self.pool).await?;

        let mut arguments = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }

        channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare queue: {}", e)))?;

        for key in &spec.routing_keys {
            channel
                .queue_bind(
                    &spec.name,
                    &spec.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Topology(format!("Failed to bind queue: {}", e)))?;
        }
        let _ = channel.close(200, "OK").await;

        self.queues
            .write()
            .await
            .insert(spec.name.clone(), spec.dead_letter_exchange.clone());

        info!(
            queue = %spec.name,
            exchange = %spec.exchange,
            routing_keys = ?spec.routing_keys,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn subscribe_with_policy(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
    ) -> Result<ConsumerHandle> {
        let first = Self::setup_consumer(&self.pool, queue).await?;
        let dead_letter_exchange = self.dead_letter_exchange_for(queue).await;

        let stats = ConsumerStats::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            queue.to_string(),
            Some(first),
            handler,
            policy,
            Arc::clone(&stats),
            Arc::clone(&self.publisher),
            dead_letter_exchange,
            shutdown_rx,
        ));

        info!(queue = %queue, max_attempts = policy.attempts(), "AMQP consumer started");
        Ok(ConsumerHandle::new(queue, stats, shutdown_tx, task))
    }

    fn default_retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    async fn close(&self) -> Result<()> {
        if let Some(channel) = self.publisher.channel.lock().await.take() {
            let _ = channel.close(200, "Bus closed").await;
        }
        self.pool.close();
        info!("AMQP bus closed");
        Ok(())
    }
}
