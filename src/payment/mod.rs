//! Payment collaborator.
//!
//! Consumes `payment-cmd-create-session`, opens a checkout session through a
//! `PaymentProcessor`, and tells the rider where to pay. The provider's
//! success webhook is modelled by `publish_payment_success`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::bus::{BusError, ConsumerHandle, HandlerError, Message, MessageBus};
use crate::contracts::events::{
    PaymentEventSessionCreatedData, PaymentStatusUpdateData, PaymentTripResponseData,
};
use crate::contracts::{
    Envelope, PAYMENT_CMD_CREATE_SESSION, PAYMENT_EVENT_SESSION_CREATED, PAYMENT_EVENT_SUCCESS,
    PAYMENT_TRIP_RESPONSE_QUEUE,
};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Invalid payment amount {amount} for trip {trip_id}")]
    InvalidAmount { trip_id: String, amount: f64 },

    #[error("Payment provider error: {0}")]
    Provider(String),
}

/// Checkout session opened with the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSession {
    pub session_id: String,
    pub trip_id: String,
    pub amount: f64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Open a checkout session for a trip. Repeated calls for the same trip
    /// return the same session.
    async fn create_session(
        &self,
        request: &PaymentTripResponseData,
    ) -> Result<PaymentSession, PaymentError>;
}

/// Processor that keeps sessions in memory.
#[derive(Default)]
pub struct InMemoryPaymentProcessor {
    sessions: RwLock<HashMap<String, PaymentSession>>,
}

impl InMemoryPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_for_trip(&self, trip_id: &str) -> Option<PaymentSession> {
        self.sessions.read().await.get(trip_id).cloned()
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryPaymentProcessor {
    async fn create_session(
        &self,
        request: &PaymentTripResponseData,
    ) -> Result<PaymentSession, PaymentError> {
        if !(request.amount.is_finite() && request.amount > 0.0) {
            return Err(PaymentError::InvalidAmount {
                trip_id: request.trip_id.clone(),
                amount: request.amount,
            });
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(request.trip_id.clone())
            .or_insert_with(|| PaymentSession {
                session_id: format!("cs_{}", Uuid::new_v4().simple()),
                trip_id: request.trip_id.clone(),
                amount: request.amount,
                currency: request.currency.clone(),
            });
        Ok(session.clone())
    }
}

/// Consumer of payment session requests.
pub struct PaymentConsumer {
    processor: Arc<dyn PaymentProcessor>,
    bus: Arc<dyn MessageBus>,
}

impl PaymentConsumer {
    pub fn new(processor: Arc<dyn PaymentProcessor>, bus: Arc<dyn MessageBus>) -> Self {
        Self { processor, bus }
    }

    pub async fn start(self: &Arc<Self>) -> Result<ConsumerHandle, BusError> {
        let consumer = Arc::clone(self);
        let handler = move |message: Arc<Message>| {
            let consumer = Arc::clone(&consumer);
            async move { consumer.handle(&message).await }
        };
        self.bus
            .subscribe(PAYMENT_TRIP_RESPONSE_QUEUE, Arc::new(handler))
            .await
    }

    #[tracing::instrument(name = "payment.create_session", skip_all)]
    pub async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        if message.routing_key != PAYMENT_CMD_CREATE_SESSION {
            return Err(HandlerError::UnexpectedRoutingKey(
                message.routing_key.clone(),
            ));
        }

        let request: PaymentTripResponseData = message.envelope()?.payload()?;
        let session = self
            .processor
            .create_session(&request)
            .await
            .map_err(HandlerError::failed)?;

        let data = PaymentEventSessionCreatedData {
            trip_id: session.trip_id.clone(),
            session_id: session.session_id.clone(),
            amount: session.amount,
            currency: session.currency.clone(),
        };
        let envelope = Envelope::targeted(request.user_id.clone(), &data).map_err(BusError::from)?;
        self.bus
            .publish(PAYMENT_EVENT_SESSION_CREATED, &envelope)
            .await?;

        info!(trip_id = %session.trip_id, session_id = %session.session_id, "Payment session created");
        Ok(())
    }
}

/// Report a completed payment, as the provider webhook does.
pub async fn publish_payment_success(
    bus: &Arc<dyn MessageBus>,
    trip_id: &str,
    user_id: &str,
    driver_id: &str,
) -> Result<(), BusError> {
    let data = PaymentStatusUpdateData {
        trip_id: trip_id.to_string(),
        user_id: user_id.to_string(),
        driver_id: driver_id.to_string(),
    };
    let envelope = Envelope::targeted(user_id, &data)?;
    bus.publish(PAYMENT_EVENT_SUCCESS, &envelope).await
}
