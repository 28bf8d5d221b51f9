//! In-process broker for standalone mode.
//!
//! Emulates the parts of a RabbitMQ topic exchange the system relies on:
//! - Topic bindings (`*` one word, `#` zero or more words, `.` separated)
//! - Durable queues shared by competing consumers
//! - Unroutable messages are dropped
//! - Rejected messages are routed to the queue's dead-letter exchange
//! - Deliveries abandoned without settlement are redelivered
//!
//! Ideal for local development and testing without external dependencies.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::{
    wait_for_shutdown, Acknowledger, BusError, ConsumerHandle, Delivery, Message, MessageBus,
    MessageHandler, QueueSpec, Result,
};
use crate::contracts::{Envelope, TRIP_EXCHANGE};
use crate::delivery::{process_delivery, ConsumerStats, RetryPolicy};

/// Check if a routing key matches a topic binding pattern.
///
/// Matching rules:
/// - Words are separated by `.`
/// - `*` matches exactly one word
/// - `#` matches zero or more words
/// - Any other word must match exactly
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

struct Binding {
    pattern: String,
    queue: String,
}

/// Ready messages of one queue. The lock is never held across an await, so
/// inspection works while consumers wait.
struct QueueState {
    name: String,
    ready: Mutex<VecDeque<Message>>,
    ready_signal: Notify,
    dead_letter_exchange: Option<String>,
}

impl QueueState {
    fn new(spec: &QueueSpec) -> Self {
        Self {
            name: spec.name.clone(),
            ready: Mutex::new(VecDeque::new()),
            ready_signal: Notify::new(),
            dead_letter_exchange: spec.dead_letter_exchange.clone(),
        }
    }

    fn ready(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, message: Message) {
        self.ready().push_back(message);
        self.ready_signal.notify_one();
    }

    fn drain(&self) -> Vec<Message> {
        self.ready().drain(..).collect()
    }

    /// Wait for the next ready message. Cancel-safe.
    async fn dequeue(&self) -> Message {
        loop {
            // An enqueue after this point leaves a permit for `notified`.
            let notified = self.ready_signal.notified();
            let next = self.ready().pop_front();
            if let Some(message) = next {
                return message;
            }
            notified.await;
        }
    }
}

/// Exchanges, bindings and queues. Synchronous locks only, so routing can run
/// from `Drop`.
#[derive(Default)]
struct Broker {
    exchanges: RwLock<HashMap<String, Vec<Binding>>>,
    queues: RwLock<HashMap<String, Arc<QueueState>>>,
}

impl Broker {
    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.queues
            .read()
            .ok()
            .and_then(|queues| queues.get(name).cloned())
    }

    /// Deliver `message` to every queue bound to `exchange` with a matching
    /// pattern. Returns the number of queues reached.
    fn route(&self, exchange: &str, message: Message) -> Result<usize> {
        let targets: Vec<String> = {
            let exchanges = self
                .exchanges
                .read()
                .map_err(|_| BusError::Publish("broker state poisoned".to_string()))?;
            let bindings = exchanges.get(exchange).ok_or_else(|| {
                BusError::Publish(format!("Exchange '{}' is not declared", exchange))
            })?;

            let mut targets: Vec<String> = Vec::new();
            for binding in bindings {
                if topic_matches(&binding.pattern, &message.routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(
                exchange = %exchange,
                routing_key = %message.routing_key,
                "Message unroutable, dropped"
            );
            return Ok(0);
        }

        let mut delivered = 0;
        for name in &targets {
            if let Some(queue) = self.queue(name) {
                let mut copy = message.clone();
                copy.exchange = exchange.to_string();
                queue.enqueue(copy);
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

/// Settles one delivery against the in-process broker.
///
/// Dropping it unsettled puts the message back on its queue flagged as
/// redelivered.
struct ChannelAcker {
    broker: Arc<Broker>,
    queue: Arc<QueueState>,
    message: Message,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, message: Message) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        let Some(dlx) = &self.queue.dead_letter_exchange else {
            warn!(
                queue = %self.queue.name,
                routing_key = %message.routing_key,
                "Rejected message discarded, queue has no dead-letter exchange"
            );
            return Ok(());
        };

        let reached = self.broker.route(dlx, message)?;
        debug!(queue = %self.queue.name, dead_letter_exchange = %dlx, reached, "Message dead-lettered");
        Ok(())
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            let mut message = self.message.clone();
            message.redelivered = true;
            debug!(
                queue = %self.queue.name,
                routing_key = %message.routing_key,
                "Unsettled delivery returned to queue"
            );
            self.queue.enqueue(message);
        }
    }
}

/// In-process message bus.
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct ChannelBus {
    broker: Arc<Broker>,
    exchange: String,
    retry_policy: RetryPolicy,
    closed: Arc<AtomicBool>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    /// Create a bus publishing to the trip exchange with the default retry policy.
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        info!("Channel bus initialized");
        Self {
            broker: Arc::new(Broker::default()),
            exchange: TRIP_EXCHANGE.to_string(),
            retry_policy,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish a raw body, bypassing envelope encoding.
    pub async fn publish_raw(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let message = Message::new(self.exchange.clone(), routing_key, body);
        self.broker.route(&self.exchange, message)?;
        Ok(())
    }

    /// Remove and return every ready message of `queue`.
    ///
    /// Safe with consumers attached. Messages a consumer is processing are
    /// not included.
    pub async fn drain_queue(&self, queue: &str) -> Result<Vec<Message>> {
        let state = self
            .broker
            .queue(queue)
            .ok_or_else(|| BusError::Subscribe(format!("Queue '{}' is not declared", queue)))?;
        Ok(state.drain())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Bus is closed".to_string()));
        }
        Ok(())
    }

    async fn consume(
        broker: Arc<Broker>,
        queue: Arc<QueueState>,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        stats: Arc<ConsumerStats>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            // One delivery at a time: the next fetch happens only after settlement.
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => None,
                message = queue.dequeue() => Some(message),
            };

            let Some(message) = next else {
                break;
            };

            let acker = ChannelAcker {
                broker: Arc::clone(&broker),
                queue: Arc::clone(&queue),
                message: message.clone(),
                settled: AtomicBool::new(false),
            };
            let delivery = Delivery::new(message, Box::new(acker));
            process_delivery(&queue.name, delivery, handler.as_ref(), policy, &stats).await;
        }

        debug!(queue = %queue.name, "Channel consumer loop exited");
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(routing_key = %routing_key))]
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let body = envelope.to_bytes()?;
        let message = Message::new(self.exchange.clone(), routing_key, body);
        let reached = self.broker.route(&self.exchange, message)?;
        debug!(queues = reached, "Published message to channel broker");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut exchanges = self
            .broker
            .exchanges
            .write()
            .map_err(|_| BusError::Topology("broker state poisoned".to_string()))?;
        exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut exchanges = self
            .broker
            .exchanges
            .write()
            .map_err(|_| BusError::Topology("broker state poisoned".to_string()))?;
        let bindings = exchanges.get_mut(&spec.exchange).ok_or_else(|| {
            BusError::Topology(format!("Exchange '{}' is not declared", spec.exchange))
        })?;

        {
            let mut queues = self
                .broker
                .queues
                .write()
                .map_err(|_| BusError::Topology("broker state poisoned".to_string()))?;
            queues
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(QueueState::new(spec)));
        }

        for key in &spec.routing_keys {
            let exists = bindings
                .iter()
                .any(|b| b.pattern == *key && b.queue == spec.name);
            if !exists {
                bindings.push(Binding {
                    pattern: key.clone(),
                    queue: spec.name.clone(),
                });
            }
        }

        debug!(
            queue = %spec.name,
            exchange = %spec.exchange,
            routing_keys = ?spec.routing_keys,
            "Queue declared"
        );
        Ok(())
    }

    async fn subscribe_with_policy(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
    ) -> Result<ConsumerHandle> {
        self.ensure_open()?;
        let state = self
            .broker
            .queue(queue)
            .ok_or_else(|| BusError::Subscribe(format!("Queue '{}' is not declared", queue)))?;

        let stats = ConsumerStats::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Self::consume(
            Arc::clone(&self.broker),
            state,
            handler,
            policy,
            Arc::clone(&stats),
            shutdown_rx,
        ));

        info!(queue = %queue, max_attempts = policy.attempts(), "Channel consumer started");
        Ok(ConsumerHandle::new(queue, stats, shutdown_tx, task))
    }

    fn default_retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!("Channel bus closed");
        Ok(())
    }
}
