//! Relay of targeted events to connected riders and drivers.
//!
//! The relay consumes the notification queues and pushes each message to
//! its `ownerID` through a `NotificationGateway` (a websocket hub in
//! production). A recipient that is not connected is not an error: the
//! message is logged and acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{BusError, ConsumerHandle, HandlerError, Message, MessageBus};
use crate::contracts::events::TripEventData;
use crate::contracts::{
    DRIVER_CMD_TRIP_REQUEST, DRIVER_CMD_TRIP_REQUEST_QUEUE, NOTIFY_DRIVER_ASSIGN_QUEUE,
    NOTIFY_NO_DRIVERS_FOUND_QUEUE, NOTIFY_PAYMENT_SESSION_CREATED_QUEUE,
};

/// Queues drained by the relay.
pub const RELAY_QUEUES: [&str; 4] = [
    DRIVER_CMD_TRIP_REQUEST_QUEUE,
    NOTIFY_NO_DRIVERS_FOUND_QUEUE,
    NOTIFY_DRIVER_ASSIGN_QUEUE,
    NOTIFY_PAYMENT_SESSION_CREATED_QUEUE,
];

/// Client-facing push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Routing key of the originating event.
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Recipient {0} is not connected")]
    NotConnected(String),

    #[error("Failed to push to {recipient}: {reason}")]
    Send { recipient: String, reason: String },
}

/// Pushes messages to a connected client.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn push(&self, recipient: &str, notification: &Notification) -> Result<(), GatewayError>;
}

/// Gateway that only logs, for running without client connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingGateway;

#[async_trait]
impl NotificationGateway for TracingGateway {
    async fn push(&self, recipient: &str, notification: &Notification) -> Result<(), GatewayError> {
        info!(recipient = %recipient, message_type = %notification.message_type, "Push notification");
        Ok(())
    }
}

/// Gateway that records pushes, with per-recipient connectivity.
#[derive(Default)]
pub struct RecordingGateway {
    pushed: RwLock<Vec<(String, Notification)>>,
    disconnected: RwLock<HashSet<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn disconnect(&self, recipient: &str) {
        self.disconnected.write().await.insert(recipient.to_string());
    }

    pub async fn reconnect(&self, recipient: &str) {
        self.disconnected.write().await.remove(recipient);
    }

    pub async fn pushed(&self) -> Vec<(String, Notification)> {
        self.pushed.read().await.clone()
    }

    /// Notifications pushed to `recipient`, oldest first.
    pub async fn pushed_to(&self, recipient: &str) -> Vec<Notification> {
        self.pushed
            .read()
            .await
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn push(&self, recipient: &str, notification: &Notification) -> Result<(), GatewayError> {
        if self.disconnected.read().await.contains(recipient) {
            return Err(GatewayError::NotConnected(recipient.to_string()));
        }
        self.pushed
            .write()
            .await
            .push((recipient.to_string(), notification.clone()));
        Ok(())
    }
}

/// Bus-to-gateway relay.
pub struct GatewayRelay {
    gateway: Arc<dyn NotificationGateway>,
    bus: Arc<dyn MessageBus>,
    /// Trip requests already pushed, per trip id.
    offered: Mutex<HashMap<String, HashSet<String>>>,
}

impl GatewayRelay {
    pub fn new(gateway: Arc<dyn NotificationGateway>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            gateway,
            bus,
            offered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<Vec<ConsumerHandle>, BusError> {
        let mut handles = Vec::with_capacity(RELAY_QUEUES.len());
        for queue in RELAY_QUEUES {
            let relay = Arc::clone(self);
            let handler = move |message: Arc<Message>| {
                let relay = Arc::clone(&relay);
                async move { relay.handle(&message).await }
            };
            handles.push(self.bus.subscribe(queue, Arc::new(handler)).await?);
        }
        Ok(handles)
    }

    #[tracing::instrument(name = "gateway.relay", skip_all, fields(routing_key = %message.routing_key))]
    pub async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let envelope = message.envelope()?;
        if !envelope.is_targeted() {
            warn!("Dropping notification without recipient");
            return Ok(());
        }
        let recipient = envelope.owner_id.as_str();

        let data = if envelope.data.is_empty() {
            serde_json::Value::Null
        } else {
            envelope.payload()?
        };

        let offered_trip = if message.routing_key == DRIVER_CMD_TRIP_REQUEST {
            let request: TripEventData = serde_json::from_value(data.clone())?;
            let offered = self.offered.lock().await;
            if offered
                .get(&request.trip.id)
                .is_some_and(|drivers| drivers.contains(recipient))
            {
                debug!(trip_id = %request.trip.id, driver_id = %recipient, "Trip request already pushed");
                return Ok(());
            }
            Some(request.trip.id)
        } else {
            None
        };

        let notification = Notification {
            message_type: message.routing_key.clone(),
            data,
        };
        match self.gateway.push(recipient, &notification).await {
            Ok(()) => {}
            Err(GatewayError::NotConnected(_)) => {
                warn!(recipient = %recipient, "Recipient not connected, dropping notification");
                return Ok(());
            }
            Err(err) => return Err(HandlerError::failed(err)),
        }

        if let Some(trip_id) = offered_trip {
            self.offered
                .lock()
                .await
                .entry(trip_id)
                .or_default()
                .insert(recipient.to_string());
        }
        Ok(())
    }
}
