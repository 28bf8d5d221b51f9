//! Event contracts shared by every service.
//!
//! This module contains:
//! - Exchange and queue names
//! - Routing keys (one payload schema per key)
//! - The queue/binding table declared at startup
//! - `Envelope`: the outer wire wrapper
//! - Per-event payload schemas

mod envelope;
pub mod events;

pub use envelope::Envelope;

/// Topic exchange carrying every trip-related event and command.
pub const TRIP_EXCHANGE: &str = "trip";
/// Topic exchange receiving messages rejected by any queue.
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";
/// Catch-all queue bound to the dead-letter exchange.
pub const DEAD_LETTER_QUEUE: &str = "dead-letter";
/// Binding pattern matching every routing key.
pub const CATCH_ALL_PATTERN: &str = "#";

/// Owner id used for commands addressed to the payment collaborator.
pub const PAYMENT_SERVICE_OWNER: &str = "payment-service";

// ============================================================================
// Routing keys
// ============================================================================

/// Trip was created and needs a driver.
pub const TRIP_EVENT_CREATED: &str = "trip-created";
/// Requested driver declined; dispatch must pick another candidate.
pub const TRIP_EVENT_DRIVER_NOT_INTERESTED: &str = "trip-driver-not-interested";
/// No candidate driver is left for the trip.
pub const TRIP_EVENT_NO_DRIVERS_FOUND: &str = "trip-no-drivers-found";
/// A driver accepted and was assigned.
pub const TRIP_EVENT_DRIVER_ASSIGNED: &str = "trip-driver-assigned";

/// Ask a specific driver to take a trip.
pub const DRIVER_CMD_TRIP_REQUEST: &str = "driver-cmd-trip-request";
/// Driver accepted the trip request.
pub const DRIVER_CMD_TRIP_ACCEPT: &str = "driver-cmd-trip-accept";
/// Driver declined the trip request.
pub const DRIVER_CMD_TRIP_DECLINE: &str = "driver-cmd-trip-decline";

/// Ask the payment collaborator to open a checkout session.
pub const PAYMENT_CMD_CREATE_SESSION: &str = "payment-cmd-create-session";
/// Checkout session is ready for the rider.
pub const PAYMENT_EVENT_SESSION_CREATED: &str = "payment-event-session-created";
/// Rider paid.
pub const PAYMENT_EVENT_SUCCESS: &str = "payment-event-success";

// ============================================================================
// Queues
// ============================================================================

pub const FIND_AVAILABLE_DRIVERS_QUEUE: &str = "find-available-drivers";
pub const DRIVER_CMD_TRIP_REQUEST_QUEUE: &str = "driver-cmd-trip-request";
pub const DRIVER_TRIP_RESPONSE_QUEUE: &str = "driver-trip-response";
pub const NOTIFY_NO_DRIVERS_FOUND_QUEUE: &str = "notify-no-drivers-found";
pub const NOTIFY_DRIVER_ASSIGN_QUEUE: &str = "notify-driver-assign";
pub const PAYMENT_TRIP_RESPONSE_QUEUE: &str = "payment-trip-response";
pub const NOTIFY_PAYMENT_SESSION_CREATED_QUEUE: &str = "notify-payment-session-created";
pub const NOTIFY_PAYMENT_SUCCESS_QUEUE: &str = "notify-payment-success";

/// Queue name and the routing keys bound to it on the trip exchange.
pub type QueueBinding = (&'static str, &'static [&'static str]);

/// Every work queue of the system with its bindings.
///
/// Multiple keys on one queue are deliberate fan-in into a single handler.
pub const QUEUE_BINDINGS: &[QueueBinding] = &[
    (
        FIND_AVAILABLE_DRIVERS_QUEUE,
        &[TRIP_EVENT_CREATED, TRIP_EVENT_DRIVER_NOT_INTERESTED],
    ),
    (DRIVER_CMD_TRIP_REQUEST_QUEUE, &[DRIVER_CMD_TRIP_REQUEST]),
    (
        DRIVER_TRIP_RESPONSE_QUEUE,
        &[DRIVER_CMD_TRIP_ACCEPT, DRIVER_CMD_TRIP_DECLINE],
    ),
    (NOTIFY_NO_DRIVERS_FOUND_QUEUE, &[TRIP_EVENT_NO_DRIVERS_FOUND]),
    (NOTIFY_DRIVER_ASSIGN_QUEUE, &[TRIP_EVENT_DRIVER_ASSIGNED]),
    (PAYMENT_TRIP_RESPONSE_QUEUE, &[PAYMENT_CMD_CREATE_SESSION]),
    (
        NOTIFY_PAYMENT_SESSION_CREATED_QUEUE,
        &[PAYMENT_EVENT_SESSION_CREATED],
    ),
    (NOTIFY_PAYMENT_SUCCESS_QUEUE, &[PAYMENT_EVENT_SUCCESS]),
];
