//! Mock message bus implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, ConsumerHandle, MessageBus, MessageHandler, QueueSpec, Result};
use crate::contracts::Envelope;
use crate::delivery::RetryPolicy;

/// Mock message bus for testing.
///
/// Records publishes and declarations; subscribing is not supported.
#[derive(Default)]
pub struct MockBus {
    published: RwLock<Vec<(String, Envelope)>>,
    exchanges: RwLock<Vec<String>>,
    queues: RwLock<Vec<QueueSpec>>,
    fail_on_publish: RwLock<bool>,
    /// Publishes that fail before `fail_on_publish` is consulted.
    failures_remaining: RwLock<u32>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `count` publishes, then succeed.
    pub async fn fail_next_publishes(&self, count: u32) {
        *self.failures_remaining.write().await = count;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<(String, Envelope)> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Envelopes published under `routing_key`, oldest first.
    pub async fn published_with_key(&self, routing_key: &str) -> Vec<Envelope> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    pub async fn declared_exchanges(&self) -> Vec<String> {
        self.exchanges.read().await.clone()
    }

    pub async fn declared_queues(&self) -> Vec<QueueSpec> {
        self.queues.read().await.clone()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        {
            let mut remaining = self.failures_remaining.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Publish("Mock transient publish failure".to_string()));
            }
        }
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((routing_key.to_string(), envelope.clone()));
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<()> {
        let mut exchanges = self.exchanges.write().await;
        if !exchanges.iter().any(|e| e == name) {
            exchanges.push(name.to_string());
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut queues = self.queues.write().await;
        if !queues.iter().any(|q| q.name == spec.name) {
            queues.push(spec.clone());
        }
        Ok(())
    }

    async fn subscribe_with_policy(
        &self,
        queue: &str,
        _handler: Arc<dyn MessageHandler>,
        _policy: RetryPolicy,
    ) -> Result<ConsumerHandle> {
        Err(BusError::Subscribe(format!(
            "Mock bus cannot consume from '{}'",
            queue
        )))
    }

    fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}
