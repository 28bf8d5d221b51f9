//! Dead-letter metadata and inspection.
//!
//! Messages that exhaust their retry budget are rejected into the `dlx`
//! exchange and collected by the catch-all `dead-letter` queue. The body is
//! never touched; failure details travel as headers.
//!
//! ## Headers
//!
//! - `x-death-reason`: last handler error
//! - `x-origin-exchange`: exchange the message was published to
//! - `x-original-routing-key`: routing key at publish time
//! - `x-retry-count`: handler invocations before rejection
//!
//! ## Usage
//!
//! ```ignore
//! let (inspector, mut entries) = DeadLetterInspector::new();
//! bus.subscribe_with_policy(DEAD_LETTER_QUEUE, Arc::new(inspector), RetryPolicy::no_retry()).await?;
//! while let Some(entry) = entries.recv().await {
//!     println!("{} failed: {}", entry.info.original_routing_key, entry.info.reason);
//! }
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{HandlerError, HeaderValue, Headers, Message, MessageHandler};
use crate::contracts::Envelope;

pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const ORIGIN_EXCHANGE_HEADER: &str = "x-origin-exchange";
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Errors that can occur when reading dead-letter metadata.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Missing dead-letter header '{0}'")]
    MissingHeader(&'static str),

    #[error("Dead-letter header '{0}' has the wrong type")]
    InvalidHeader(&'static str),
}

/// Why and where a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterInfo {
    pub reason: String,
    pub origin_exchange: String,
    pub original_routing_key: String,
    pub retry_count: u32,
}

impl DeadLetterInfo {
    /// Build the metadata for a message that failed `retry_count` times.
    pub fn for_message(message: &Message, reason: impl Into<String>, retry_count: u32) -> Self {
        Self {
            reason: reason.into(),
            origin_exchange: message.exchange.clone(),
            original_routing_key: message.routing_key.clone(),
            retry_count,
        }
    }

    /// Write the metadata into `headers`, leaving unrelated headers intact.
    pub fn apply(&self, headers: &mut Headers) {
        headers.insert(
            DEATH_REASON_HEADER.to_string(),
            HeaderValue::from(self.reason.as_str()),
        );
        headers.insert(
            ORIGIN_EXCHANGE_HEADER.to_string(),
            HeaderValue::from(self.origin_exchange.as_str()),
        );
        headers.insert(
            ORIGINAL_ROUTING_KEY_HEADER.to_string(),
            HeaderValue::from(self.original_routing_key.as_str()),
        );
        headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::from(i64::from(self.retry_count)),
        );
    }

    /// Copy of `message` carrying the metadata. The body is shared unchanged.
    pub fn annotate(&self, message: &Message) -> Message {
        let mut annotated = message.clone();
        self.apply(&mut annotated.headers);
        annotated
    }

    /// Read the metadata back from a dead-lettered message.
    pub fn from_headers(headers: &Headers) -> Result<Self, DlqError> {
        let text = |name: &'static str| -> Result<String, DlqError> {
            headers
                .get(name)
                .ok_or(DlqError::MissingHeader(name))?
                .as_text()
                .map(str::to_string)
                .ok_or(DlqError::InvalidHeader(name))
        };

        let retry_count = headers
            .get(RETRY_COUNT_HEADER)
            .ok_or(DlqError::MissingHeader(RETRY_COUNT_HEADER))?
            .as_int()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DlqError::InvalidHeader(RETRY_COUNT_HEADER))?;

        Ok(Self {
            reason: text(DEATH_REASON_HEADER)?,
            origin_exchange: text(ORIGIN_EXCHANGE_HEADER)?,
            original_routing_key: text(ORIGINAL_ROUTING_KEY_HEADER)?,
            retry_count,
        })
    }
}

/// A message found in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub info: DeadLetterInfo,
    /// Decoded envelope, if the body was a valid one.
    pub envelope: Option<Envelope>,
    pub message: Message,
}

impl DeadLetterEntry {
    pub fn from_message(message: Message) -> Result<Self, DlqError> {
        let info = DeadLetterInfo::from_headers(&message.headers)?;
        let envelope = message.envelope().ok();
        Ok(Self {
            info,
            envelope,
            message,
        })
    }
}

/// Parse drained dead-letter messages, skipping ones without metadata.
pub fn inspect(messages: Vec<Message>) -> Vec<DeadLetterEntry> {
    messages
        .into_iter()
        .filter_map(|message| match DeadLetterEntry::from_message(message) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping dead letter without metadata");
                None
            }
        })
        .collect()
}

/// Handler for the dead-letter queue that forwards entries to a channel.
///
/// Every dead letter is logged at warn level. Messages are acked once
/// forwarded, so subscribe with `RetryPolicy::no_retry()`.
pub struct DeadLetterInspector {
    sender: mpsc::UnboundedSender<DeadLetterEntry>,
}

impl DeadLetterInspector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetterEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl MessageHandler for DeadLetterInspector {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let sender = self.sender.clone();
        Box::pin(async move {
            let entry = match DeadLetterEntry::from_message(message.as_ref().clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        routing_key = %message.routing_key,
                        error = %e,
                        "Dead letter without metadata"
                    );
                    return Ok(());
                }
            };

            warn!(
                routing_key = %entry.info.original_routing_key,
                origin_exchange = %entry.info.origin_exchange,
                retry_count = entry.info.retry_count,
                reason = %entry.info.reason,
                "Dead letter received"
            );

            if sender.send(entry).is_err() {
                debug!("Dead-letter receiver dropped");
            }
            Ok(())
        })
    }
}
