//! Trip lifecycle state machine.
//!
//! ```text
//! pending ──TripCreated──▶ dispatching ──DriverAccepted──▶ driver_assigned
//!                            │  ▲   ▲                              │
//!          DriverDeclined /  │  │   └─ DriverDeclined (remain)     │ PaymentSessionRequested
//!       CandidatesExhausted  ▼  │ Redispatch                       ▼
//!                          no_drivers                       payment_pending
//!                                                                  │ PaymentSessionCompleted
//!                                                                  ▼
//!                                                          payment_completed
//! ```
//!
//! `Cancel` is accepted from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a trip is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Pending,
    Dispatching,
    DriverAssigned,
    NoDrivers,
    PaymentPending,
    PaymentCompleted,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Pending => "pending",
            TripStatus::Dispatching => "dispatching",
            TripStatus::DriverAssigned => "driver_assigned",
            TripStatus::NoDrivers => "no_drivers",
            TripStatus::PaymentPending => "payment_pending",
            TripStatus::PaymentCompleted => "payment_completed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::PaymentCompleted | TripStatus::Cancelled)
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripEvent {
    TripCreated,
    /// The requested driver declined; `candidates_remain` tells whether
    /// another driver can still be asked this round.
    DriverDeclined { candidates_remain: bool },
    /// The first lookup of a round returned nobody.
    CandidatesExhausted,
    DriverAccepted,
    PaymentSessionRequested,
    PaymentSessionCompleted,
    /// Start a new dispatch round after `no_drivers`.
    Redispatch,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid transition: {event:?} is not allowed from {from}")]
    InvalidTransition { from: TripStatus, event: TripEvent },
}

/// Next state for `event` applied in `from`.
pub fn transition(from: TripStatus, event: TripEvent) -> Result<TripStatus, TransitionError> {
    use TripEvent as E;
    use TripStatus as S;

    let next = match (from, event) {
        (S::Pending, E::TripCreated) => S::Dispatching,
        (S::Dispatching, E::DriverDeclined { candidates_remain: true }) => S::Dispatching,
        (S::Dispatching, E::DriverDeclined { candidates_remain: false }) => S::NoDrivers,
        (S::Dispatching, E::CandidatesExhausted) => S::NoDrivers,
        (S::Dispatching, E::DriverAccepted) => S::DriverAssigned,
        (S::DriverAssigned, E::PaymentSessionRequested) => S::PaymentPending,
        (S::PaymentPending, E::PaymentSessionCompleted) => S::PaymentCompleted,
        (S::NoDrivers, E::Redispatch) => S::Dispatching,
        (state, E::Cancel) if !state.is_terminal() => S::Cancelled,
        (from, event) => return Err(TransitionError::InvalidTransition { from, event }),
    };
    Ok(next)
}
