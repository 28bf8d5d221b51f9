//! Message bus for choreographed delivery.
//!
//! This module contains:
//! - `MessageBus` trait: publish, topology declaration, subscription
//! - `MessageHandler` trait: for processing deliveries
//! - `Message`/`Delivery`/`Acknowledger`: the broker-neutral delivery model
//! - Implementations: Channel (in-process broker), AMQP (RabbitMQ), Mock

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{MessagingConfig, MessagingType};
use crate::contracts::{Envelope, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, CATCH_ALL_PATTERN};
use crate::delivery::{ConsumerStats, RetryPolicy};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBus, AmqpBusConfig};
#[cfg(feature = "channel")]
pub use channel::ChannelBus;
pub use mock::MockBus;
pub use topology::declare_topology;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Error returned by a handler to request a retry.
///
/// Handlers never ack or nack; returning an error is the only signal.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Unexpected routing key '{0}'")]
    UnexpectedRoutingKey(String),

    #[error("{0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Wrap any collaborator error.
    pub fn failed(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Box::new(err))
    }
}

// ============================================================================
// Delivery model
// ============================================================================

/// Header value as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            HeaderValue::Text(_) => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(s) => f.write_str(s),
            HeaderValue::Int(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

/// Message headers, ordered for stable logging.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A message as received from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Exchange the message was last routed through.
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Set when the broker delivers a message a second time.
    pub redelivered: bool,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers: Headers::new(),
            body,
            redelivered: false,
        }
    }

    /// Decode the body as an envelope.
    pub fn envelope(&self) -> std::result::Result<Envelope, serde_json::Error> {
        Envelope::from_bytes(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

/// Settles a delivery with the broker.
///
/// Only the delivery layer calls this.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the queue.
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue so the message lands in the dead-letter exchange.
    ///
    /// `message` is the original message with its headers augmented.
    async fn reject(&self, message: Message) -> Result<()>;
}

/// A message plus the means to settle it.
pub struct Delivery {
    pub message: Arc<Message>,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            message: Arc::new(message),
            acker,
        }
    }
}

/// Handler for processing deliveries from a queue.
pub trait MessageHandler: Send + Sync {
    /// Process one message. Must be safe to repeat.
    fn handle(&self, message: Arc<Message>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        message: Arc<Message>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Durable queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    /// Overflow target for rejected messages.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Work queue bound to `routing_keys`, overflowing into the dead-letter exchange.
    pub fn bound(name: &str, exchange: &str, routing_keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            exchange: exchange.to_string(),
            routing_keys: routing_keys.iter().map(|k| k.to_string()).collect(),
            dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
        }
    }

    /// The catch-all quarantine queue.
    pub fn dead_letter() -> Self {
        Self {
            name: DEAD_LETTER_QUEUE.to_string(),
            exchange: DEAD_LETTER_EXCHANGE.to_string(),
            routing_keys: vec![CATCH_ALL_PATTERN.to_string()],
            dead_letter_exchange: None,
        }
    }
}

// ============================================================================
// Consumers
// ============================================================================

/// Handle to a running consumption task.
pub struct ConsumerHandle {
    queue: String,
    stats: Arc<ConsumerStats>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn new(
        queue: impl Into<String>,
        stats: Arc<ConsumerStats>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            queue: queue.into(),
            stats,
            shutdown,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Stop fetching and wait for the in-flight message, up to `deadline`.
    ///
    /// Returns false if the task had to be abandoned; its unsettled delivery
    /// is then redelivered by the broker.
    pub async fn shutdown(self, deadline: Duration) -> bool {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(_) => {
                info!(queue = %self.queue, "Consumer stopped");
                true
            }
            Err(_) => {
                warn!(queue = %self.queue, "Consumer missed shutdown deadline, abandoning");
                task.abort();
                // Wait for the cancelled task to drop its unsettled delivery.
                let _ = task.await;
                false
            }
        }
    }
}

/// Resolves once shutdown is requested.
///
/// A dropped `ConsumerHandle` detaches the consumer rather than stopping it.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Bus trait
// ============================================================================

/// Interface for topic-routed, at-least-once delivery.
///
/// Implementations:
/// - `ChannelBus`: in-process broker (standalone mode and tests)
/// - `AmqpBus`: RabbitMQ via AMQP
/// - `MockBus`: records publishes for unit tests
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to the trip exchange under `routing_key`.
    ///
    /// Single attempt. Retrying is the caller's concern.
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()>;

    /// Declare a durable topic exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a durable queue and bind it. Idempotent.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Start a consumer on `queue` with an explicit retry policy.
    async fn subscribe_with_policy(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
    ) -> Result<ConsumerHandle>;

    /// Process-wide retry policy used by `subscribe`.
    fn default_retry_policy(&self) -> RetryPolicy;

    /// Start a consumer on `queue` with the default retry policy.
    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        let policy = self.default_retry_policy();
        self.subscribe_with_policy(queue, handler, policy).await
    }

    /// Release broker resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the message bus based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - AMQP: `--features amqp`
pub async fn connect_bus(
    config: &MessagingConfig,
    policy: RetryPolicy,
) -> std::result::Result<Arc<dyn MessageBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelBus::with_retry_policy(policy);
                info!(messaging_type = "channel", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                let _ = policy;
                Err("Channel bus requires the 'channel' feature".into())
            }
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let amqp_config = AmqpBusConfig::new(&config.amqp.url)
                    .with_pool_size(config.amqp.pool_size);
                let bus = AmqpBus::new(amqp_config, policy).await?;
                info!(messaging_type = "amqp", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = policy;
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}
