//! Trip dispatch saga.
//!
//! Matches a trip to a driver by choreography. Each step reacts to one
//! event, updates the trip, and publishes the next event; nothing blocks
//! waiting for a reply.
//!
//! - `find-available-drivers`: pick the next candidate, or give up with
//!   `trip-no-drivers-found`
//! - `driver-trip-response`: record a decline, or assign the driver and
//!   hand off to payment
//! - `notify-payment-success`: close the trip
//!
//! Every step tolerates redelivery. Events that arrive after the trip moved
//! on are logged and acknowledged. Trip writes are conditional on the status
//! the step read, so a trip cancelled while a step waits on a collaborator
//! stays cancelled.


use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{BusError, ConsumerHandle, HandlerError, Message, MessageBus};
use crate::contracts::events::{
    DriverInfo, DriverTripResponseData, PaymentStatusUpdateData, PaymentTripResponseData,
    TripEventData,
};
use crate::contracts::{
    Envelope, DRIVER_CMD_TRIP_ACCEPT, DRIVER_CMD_TRIP_DECLINE, DRIVER_CMD_TRIP_REQUEST,
    DRIVER_TRIP_RESPONSE_QUEUE, FIND_AVAILABLE_DRIVERS_QUEUE, NOTIFY_PAYMENT_SUCCESS_QUEUE,
    PAYMENT_CMD_CREATE_SESSION, PAYMENT_SERVICE_OWNER, TRIP_EVENT_CREATED,
    TRIP_EVENT_DRIVER_ASSIGNED, TRIP_EVENT_DRIVER_NOT_INTERESTED, TRIP_EVENT_NO_DRIVERS_FOUND,
};
use crate::drivers::{DriverLookup, LookupError};
use crate::trip::{
    transition, RepositoryError, TransitionError, Trip, TripEvent, TripRepository, TripStatus,
};

/// Currency of payment sessions requested by the saga.
pub const PAYMENT_CURRENCY: &str = "USD";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected routing key '{0}'")]
    UnexpectedRoutingKey(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Driver lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<DispatchError> for HandlerError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Malformed(e) => HandlerError::Malformed(e),
            DispatchError::UnexpectedRoutingKey(key) => HandlerError::UnexpectedRoutingKey(key),
            DispatchError::Bus(e) => HandlerError::Bus(e),
            other => HandlerError::failed(other),
        }
    }
}

type Result<T> = std::result::Result<T, DispatchError>;

/// `Ok(None)` when the trip changed status underneath the step.
fn unless_moved_on(
    trip_id: &str,
    result: std::result::Result<Trip, RepositoryError>,
) -> Result<Option<Trip>> {
    match result {
        Ok(trip) => Ok(Some(trip)),
        Err(RepositoryError::StatusConflict {
            expected, actual, ..
        }) => {
            info!(
                trip_id = %trip_id,
                %expected,
                %actual,
                "Trip moved on during saga step, dropping"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// The dispatch saga and its collaborators.
pub struct DispatchSaga {
    repo: Arc<dyn TripRepository>,
    drivers: Arc<dyn DriverLookup>,
    bus: Arc<dyn MessageBus>,
}

impl DispatchSaga {
    pub fn new(
        repo: Arc<dyn TripRepository>,
        drivers: Arc<dyn DriverLookup>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self { repo, drivers, bus }
    }

    /// Subscribe every saga step to its queue.
    pub async fn start(self: &Arc<Self>) -> std::result::Result<Vec<ConsumerHandle>, BusError> {
        let mut handles = Vec::with_capacity(3);

        let saga = Arc::clone(self);
        let find_drivers = move |message: Arc<Message>| {
            let saga = Arc::clone(&saga);
            async move { saga.on_trip_event(&message).await.map_err(HandlerError::from) }
        };
        handles.push(
            self.bus
                .subscribe(FIND_AVAILABLE_DRIVERS_QUEUE, Arc::new(find_drivers))
                .await?,
        );

        let saga = Arc::clone(self);
        let driver_response = move |message: Arc<Message>| {
            let saga = Arc::clone(&saga);
            async move {
                saga.on_driver_response(&message)
                    .await
                    .map_err(HandlerError::from)
            }
        };
        handles.push(
            self.bus
                .subscribe(DRIVER_TRIP_RESPONSE_QUEUE, Arc::new(driver_response))
                .await?,
        );

        let saga = Arc::clone(self);
        let payment_success = move |message: Arc<Message>| {
            let saga = Arc::clone(&saga);
            async move {
                saga.on_payment_success(&message)
                    .await
                    .map_err(HandlerError::from)
            }
        };
        handles.push(
            self.bus
                .subscribe(NOTIFY_PAYMENT_SUCCESS_QUEUE, Arc::new(payment_success))
                .await?,
        );

        info!("Dispatch saga started");
        Ok(handles)
    }

    // ------------------------------------------------------------------
    // Driver lookup step
    // ------------------------------------------------------------------

    /// `trip-created` / `trip-driver-not-interested`.
    #[tracing::instrument(name = "saga.find_drivers", skip_all, fields(routing_key = %message.routing_key))]
    pub async fn on_trip_event(&self, message: &Message) -> Result<()> {
        if message.routing_key != TRIP_EVENT_CREATED
            && message.routing_key != TRIP_EVENT_DRIVER_NOT_INTERESTED
        {
            return Err(DispatchError::UnexpectedRoutingKey(
                message.routing_key.clone(),
            ));
        }

        let data: TripEventData = message.envelope()?.payload()?;
        let trip = self.repo.get_trip(&data.trip.id).await?;

        match trip.status {
            TripStatus::Pending => {
                let next = transition(trip.status, TripEvent::TripCreated)?;
                let updated = self.repo.update_trip(&trip.id, trip.status, next, None).await;
                match unless_moved_on(&trip.id, updated)? {
                    Some(trip) => self.select_driver(trip).await,
                    None => Ok(()),
                }
            }
            TripStatus::Dispatching => self.select_driver(trip).await,
            TripStatus::NoDrivers => {
                // Redelivery after giving up: the rider may have missed it.
                self.notify_no_drivers(&trip).await
            }
            status => {
                debug!(trip_id = %trip.id, %status, "Trip past dispatch, ignoring");
                Ok(())
            }
        }
    }

    /// Ask the first candidate that has not declined this round.
    async fn select_driver(&self, trip: Trip) -> Result<()> {
        let candidates = self
            .drivers
            .find_available_drivers(&trip.fare.package_slug)
            .await?;
        let next_driver = candidates.into_iter().find(|id| !trip.has_declined(id));

        let Some(driver_id) = next_driver else {
            let event = if trip.declined_drivers.is_empty() {
                TripEvent::CandidatesExhausted
            } else {
                TripEvent::DriverDeclined {
                    candidates_remain: false,
                }
            };
            let next = transition(trip.status, event)?;
            let updated = self.repo.update_trip(&trip.id, trip.status, next, None).await;
            let Some(trip) = unless_moved_on(&trip.id, updated)? else {
                return Ok(());
            };

            info!(
                trip_id = %trip.id,
                declined = trip.declined_drivers.len(),
                "No drivers available"
            );
            return self.notify_no_drivers(&trip).await;
        };

        if !trip.declined_drivers.is_empty() {
            transition(
                trip.status,
                TripEvent::DriverDeclined {
                    candidates_remain: true,
                },
            )?;
        }

        let updated = self
            .repo
            .set_requested_driver(&trip.id, Some(driver_id.clone()))
            .await;
        let Some(trip) = unless_moved_on(&trip.id, updated)? else {
            return Ok(());
        };
        self.publish(
            DRIVER_CMD_TRIP_REQUEST,
            &driver_id,
            &TripEventData {
                trip: trip.snapshot(),
            },
        )
        .await?;

        info!(trip_id = %trip.id, driver_id = %driver_id, "Trip offered to driver");
        Ok(())
    }

    async fn notify_no_drivers(&self, trip: &Trip) -> Result<()> {
        self.publish(
            TRIP_EVENT_NO_DRIVERS_FOUND,
            &trip.user_id,
            &TripEventData {
                trip: trip.snapshot(),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Driver response step
    // ------------------------------------------------------------------

    /// `driver-cmd-trip-accept` / `driver-cmd-trip-decline`.
    #[tracing::instrument(name = "saga.driver_response", skip_all, fields(routing_key = %message.routing_key))]
    pub async fn on_driver_response(&self, message: &Message) -> Result<()> {
        let accepted = match message.routing_key.as_str() {
            DRIVER_CMD_TRIP_ACCEPT => true,
            DRIVER_CMD_TRIP_DECLINE => false,
            other => return Err(DispatchError::UnexpectedRoutingKey(other.to_string())),
        };

        let data: DriverTripResponseData = message.envelope()?.payload()?;
        let trip = self.repo.get_trip(&data.trip_id).await?;

        if accepted {
            self.driver_accepted(trip, data.driver).await
        } else {
            self.driver_declined(trip, &data.driver.id).await
        }
    }

    async fn driver_declined(&self, trip: Trip, driver_id: &str) -> Result<()> {
        let requested = trip.requested_driver.as_deref() == Some(driver_id);
        // A decline already recorded whose follow-up publish failed.
        let resumed = trip.requested_driver.is_none() && trip.has_declined(driver_id);

        if trip.status != TripStatus::Dispatching || !(requested || resumed) {
            info!(
                trip_id = %trip.id,
                driver_id = %driver_id,
                status = %trip.status,
                "Ignoring decline from driver not currently requested"
            );
            return Ok(());
        }

        let updated = self.repo.record_decline(&trip.id, driver_id).await;
        let Some(trip) = unless_moved_on(&trip.id, updated)? else {
            return Ok(());
        };
        self.publish(
            TRIP_EVENT_DRIVER_NOT_INTERESTED,
            &trip.user_id,
            &TripEventData {
                trip: trip.snapshot(),
            },
        )
        .await?;

        info!(trip_id = %trip.id, driver_id = %driver_id, "Driver declined trip");
        Ok(())
    }

    async fn driver_accepted(&self, trip: Trip, driver: DriverInfo) -> Result<()> {
        match trip.status {
            TripStatus::Dispatching if trip.requested_driver.as_deref() == Some(&driver.id) => {
                let next = transition(trip.status, TripEvent::DriverAccepted)?;
                let updated = self
                    .repo
                    .update_trip(&trip.id, trip.status, next, Some(driver.clone()))
                    .await;
                let Some(trip) = unless_moved_on(&trip.id, updated)? else {
                    return Ok(());
                };

                info!(trip_id = %trip.id, driver_id = %driver.id, "Driver assigned");
                self.hand_off_to_payment(trip).await
            }
            // Assigned but the payment hand-off did not finish.
            TripStatus::DriverAssigned
                if trip.driver.as_ref().map(|d| d.id.as_str()) == Some(driver.id.as_str()) =>
            {
                warn!(trip_id = %trip.id, "Resuming payment hand-off");
                self.hand_off_to_payment(trip).await
            }
            status => {
                info!(
                    trip_id = %trip.id,
                    driver_id = %driver.id,
                    %status,
                    "Ignoring accept from driver not currently requested"
                );
                Ok(())
            }
        }
    }

    async fn hand_off_to_payment(&self, trip: Trip) -> Result<()> {
        let snapshot = TripEventData {
            trip: trip.snapshot(),
        };
        self.publish(TRIP_EVENT_DRIVER_ASSIGNED, &trip.user_id, &snapshot)
            .await?;

        let driver_id = trip.driver.as_ref().map(|d| d.id.clone()).unwrap_or_default();
        let request = PaymentTripResponseData {
            trip_id: trip.id.clone(),
            user_id: trip.user_id.clone(),
            driver_id,
            amount: trip.fare.total_price_in_cents,
            currency: PAYMENT_CURRENCY.to_string(),
        };
        self.publish(PAYMENT_CMD_CREATE_SESSION, PAYMENT_SERVICE_OWNER, &request)
            .await?;

        let next = transition(trip.status, TripEvent::PaymentSessionRequested)?;
        let updated = self.repo.update_trip(&trip.id, trip.status, next, None).await;
        if unless_moved_on(&trip.id, updated)?.is_some() {
            debug!(trip_id = %trip.id, "Payment session requested");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment step
    // ------------------------------------------------------------------

    /// `payment-event-success`.
    #[tracing::instrument(name = "saga.payment_success", skip_all)]
    pub async fn on_payment_success(&self, message: &Message) -> Result<()> {
        let data: PaymentStatusUpdateData = message.envelope()?.payload()?;
        let trip = self.repo.get_trip(&data.trip_id).await?;

        if trip.status == TripStatus::PaymentCompleted {
            debug!(trip_id = %trip.id, "Payment already recorded");
            return Ok(());
        }

        // A conflict here is retried: the next attempt re-reads the trip.
        let next = transition(trip.status, TripEvent::PaymentSessionCompleted)?;
        self.repo.update_trip(&trip.id, trip.status, next, None).await?;

        info!(trip_id = %trip.id, "Trip paid");
        Ok(())
    }

    async fn publish<T: Serialize>(&self, routing_key: &str, owner_id: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::targeted(owner_id, payload).map_err(BusError::from)?;
        self.bus.publish(routing_key, &envelope).await?;
        Ok(())
    }
}
