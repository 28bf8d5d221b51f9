//! Trip and fare records owned by the trip service.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::status::TripStatus;
use crate::contracts::events::{DriverInfo, RideFareSnapshot, Route, TripSnapshot};

/// Priced offer for one vehicle package. Immutable once saved.
#[derive(Debug, Clone, PartialEq)]
pub struct RideFare {
    pub id: String,
    pub user_id: String,
    pub package_slug: String,
    pub total_price_in_cents: f64,
    pub route: Option<Route>,
}

impl RideFare {
    pub fn new(
        user_id: impl Into<String>,
        package_slug: impl Into<String>,
        total_price_in_cents: f64,
        route: Option<Route>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            package_slug: package_slug.into(),
            total_price_in_cents,
            route,
        }
    }

    pub fn snapshot(&self) -> RideFareSnapshot {
        RideFareSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            package_slug: self.package_slug.clone(),
            total_price_in_cents: self.total_price_in_cents,
        }
    }
}

/// A ride request and its dispatch bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: String,
    pub user_id: String,
    pub fare: RideFare,
    pub status: TripStatus,
    /// Set once a driver accepted.
    pub driver: Option<DriverInfo>,
    /// Driver currently asked to take the trip.
    pub requested_driver: Option<String>,
    /// Drivers that declined during the current dispatch round.
    pub declined_drivers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Trip {
    /// New `pending` trip for the fare's owner.
    pub fn new(fare: RideFare) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: fare.user_id.clone(),
            fare,
            status: TripStatus::Pending,
            driver: None,
            requested_driver: None,
            declined_drivers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_declined(&self, driver_id: &str) -> bool {
        self.declined_drivers.iter().any(|d| d == driver_id)
    }

    /// Serialized view shared with other services.
    pub fn snapshot(&self) -> TripSnapshot {
        TripSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: self.status.to_string(),
            selected_fare: self.fare.snapshot(),
            route: self.fare.route.clone(),
            driver: self.driver.clone(),
        }
    }
}
