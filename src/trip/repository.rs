//! Trip and fare persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::model::{RideFare, Trip};
use super::status::TripStatus;
use crate::contracts::events::DriverInfo;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("Trip {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: String,
        expected: TripStatus,
        actual: TripStatus,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl RepositoryError {
    fn trip_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "trip",
            id: id.to_string(),
        }
    }
}

/// Storage for trips and fares.
///
/// Mutators return the trip as stored after the change. Trip mutators are
/// conditional on the stored status and fail with `StatusConflict`, leaving
/// the trip untouched, when it no longer matches.
#[async_trait]
pub trait TripRepository: Send + Sync {
    async fn save_fare(&self, fare: RideFare) -> Result<()>;

    async fn get_fare(&self, fare_id: &str) -> Result<RideFare>;

    async fn create_trip(&self, trip: Trip) -> Result<Trip>;

    async fn get_trip(&self, trip_id: &str) -> Result<Trip>;

    /// Move the trip from `expected` to `status`, and set the assigned
    /// driver when `driver` is given.
    async fn update_trip(
        &self,
        trip_id: &str,
        expected: TripStatus,
        status: TripStatus,
        driver: Option<DriverInfo>,
    ) -> Result<Trip>;

    /// Only while the trip is dispatching.
    async fn set_requested_driver(&self, trip_id: &str, driver_id: Option<String>) -> Result<Trip>;

    /// Remember that `driver_id` declined this round and clear the pending
    /// request. Only while the trip is dispatching.
    async fn record_decline(&self, trip_id: &str, driver_id: &str) -> Result<Trip>;

    /// Forget declines and the pending request before a new round.
    async fn reset_dispatch_round(&self, trip_id: &str) -> Result<Trip>;
}

/// In-memory repository for standalone mode and tests.
#[derive(Default)]
pub struct InMemoryTripRepository {
    trips: RwLock<HashMap<String, Trip>>,
    fares: RwLock<HashMap<String, RideFare>>,
}

impl InMemoryTripRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify(
        &self,
        trip_id: &str,
        expected: Option<TripStatus>,
        change: impl FnOnce(&mut Trip),
    ) -> Result<Trip> {
        let mut trips = self.trips.write().await;
        let trip = trips
            .get_mut(trip_id)
            .ok_or_else(|| RepositoryError::trip_not_found(trip_id))?;
        if let Some(expected) = expected {
            if trip.status != expected {
                return Err(RepositoryError::StatusConflict {
                    id: trip_id.to_string(),
                    expected,
                    actual: trip.status,
                });
            }
        }
        change(trip);
        Ok(trip.clone())
    }
}

#[async_trait]
impl TripRepository for InMemoryTripRepository {
    async fn save_fare(&self, fare: RideFare) -> Result<()> {
        self.fares.write().await.insert(fare.id.clone(), fare);
        Ok(())
    }

    async fn get_fare(&self, fare_id: &str) -> Result<RideFare> {
        self.fares
            .read()
            .await
            .get(fare_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "fare",
                id: fare_id.to_string(),
            })
    }

    async fn create_trip(&self, trip: Trip) -> Result<Trip> {
        let mut trips = self.trips.write().await;
        if trips.contains_key(&trip.id) {
            return Err(RepositoryError::AlreadyExists {
                entity: "trip",
                id: trip.id,
            });
        }
        trips.insert(trip.id.clone(), trip.clone());
        Ok(trip)
    }

    async fn get_trip(&self, trip_id: &str) -> Result<Trip> {
        self.trips
            .read()
            .await
            .get(trip_id)
            .cloned()
            .ok_or_else(|| RepositoryError::trip_not_found(trip_id))
    }

    async fn update_trip(
        &self,
        trip_id: &str,
        expected: TripStatus,
        status: TripStatus,
        driver: Option<DriverInfo>,
    ) -> Result<Trip> {
        self.modify(trip_id, Some(expected), |trip| {
            trip.status = status;
            if driver.is_some() {
                trip.driver = driver;
            }
        })
        .await
    }

    async fn set_requested_driver(&self, trip_id: &str, driver_id: Option<String>) -> Result<Trip> {
        self.modify(trip_id, Some(TripStatus::Dispatching), |trip| {
            trip.requested_driver = driver_id
        })
        .await
    }

    async fn record_decline(&self, trip_id: &str, driver_id: &str) -> Result<Trip> {
        self.modify(trip_id, Some(TripStatus::Dispatching), |trip| {
            if !trip.has_declined(driver_id) {
                trip.declined_drivers.push(driver_id.to_string());
            }
            if trip.requested_driver.as_deref() == Some(driver_id) {
                trip.requested_driver = None;
            }
        })
        .await
    }

    async fn reset_dispatch_round(&self, trip_id: &str) -> Result<Trip> {
        self.modify(trip_id, None, |trip| {
            trip.declined_drivers.clear();
            trip.requested_driver = None;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trip() -> Trip {
        Trip::new(RideFare::new("rider-1", "sedan", 1000.0, None))
    }

    async fn dispatching_trip(repo: &InMemoryTripRepository) -> Trip {
        let trip = repo.create_trip(sample_trip()).await.unwrap();
        repo.update_trip(&trip.id, TripStatus::Pending, TripStatus::Dispatching, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fare_round_trip() {
        let repo = InMemoryTripRepository::new();
        let fare = RideFare::new("rider-1", "suv", 1500.0, None);
        repo.save_fare(fare.clone()).await.unwrap();

        assert_eq!(repo.get_fare(&fare.id).await.unwrap(), fare);
        assert!(matches!(
            repo.get_fare("missing").await,
            Err(RepositoryError::NotFound { entity: "fare", .. })
        ));
    }

    #[tokio::test]
    async fn test_create_trip_twice_fails() {
        let repo = InMemoryTripRepository::new();
        let trip = sample_trip();
        repo.create_trip(trip.clone()).await.unwrap();

        assert!(matches!(
            repo.create_trip(trip).await,
            Err(RepositoryError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_trip_keeps_driver_when_not_given() {
        let repo = InMemoryTripRepository::new();
        let trip = repo.create_trip(sample_trip()).await.unwrap();
        let driver = DriverInfo {
            id: "d1".to_string(),
            ..Default::default()
        };

        repo.update_trip(
            &trip.id,
            TripStatus::Pending,
            TripStatus::DriverAssigned,
            Some(driver.clone()),
        )
        .await
        .unwrap();
        let updated = repo
            .update_trip(
                &trip.id,
                TripStatus::DriverAssigned,
                TripStatus::PaymentPending,
                None,
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TripStatus::PaymentPending);
        assert_eq!(updated.driver, Some(driver));
    }

    #[tokio::test]
    async fn test_record_decline_is_idempotent_and_clears_request() {
        let repo = InMemoryTripRepository::new();
        let trip = dispatching_trip(&repo).await;
        repo.set_requested_driver(&trip.id, Some("d1".to_string()))
            .await
            .unwrap();

        repo.record_decline(&trip.id, "d1").await.unwrap();
        let trip = repo.record_decline(&trip.id, "d1").await.unwrap();

        assert_eq!(trip.declined_drivers, vec!["d1"]);
        assert!(trip.requested_driver.is_none());
    }

    #[tokio::test]
    async fn test_reset_dispatch_round() {
        let repo = InMemoryTripRepository::new();
        let trip = dispatching_trip(&repo).await;
        repo.record_decline(&trip.id, "d1").await.unwrap();
        repo.set_requested_driver(&trip.id, Some("d2".to_string()))
            .await
            .unwrap();

        let trip = repo.reset_dispatch_round(&trip.id).await.unwrap();
        assert!(trip.declined_drivers.is_empty());
        assert!(trip.requested_driver.is_none());
    }

    #[tokio::test]
    async fn test_unknown_trip() {
        let repo = InMemoryTripRepository::new();
        assert!(matches!(
            repo.update_trip("nope", TripStatus::Pending, TripStatus::Cancelled, None)
                .await,
            Err(RepositoryError::NotFound { entity: "trip", .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_and_keeps_trip() {
        let repo = InMemoryTripRepository::new();
        let trip = dispatching_trip(&repo).await;
        repo.update_trip(&trip.id, TripStatus::Dispatching, TripStatus::Cancelled, None)
            .await
            .unwrap();

        let driver = DriverInfo {
            id: "d1".to_string(),
            ..Default::default()
        };
        let err = repo
            .update_trip(
                &trip.id,
                TripStatus::Dispatching,
                TripStatus::DriverAssigned,
                Some(driver),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::StatusConflict {
                expected: TripStatus::Dispatching,
                actual: TripStatus::Cancelled,
                ..
            }
        ));

        let stored = repo.get_trip(&trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Cancelled);
        assert!(stored.driver.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_bookkeeping_requires_dispatching() {
        let repo = InMemoryTripRepository::new();
        let trip = repo.create_trip(sample_trip()).await.unwrap();

        assert!(matches!(
            repo.set_requested_driver(&trip.id, Some("d1".to_string())).await,
            Err(RepositoryError::StatusConflict { .. })
        ));
        assert!(matches!(
            repo.record_decline(&trip.id, "d1").await,
            Err(RepositoryError::StatusConflict { .. })
        ));
        let stored = repo.get_trip(&trip.id).await.unwrap();
        assert!(stored.requested_driver.is_none());
        assert!(stored.declined_drivers.is_empty());
    }
}
