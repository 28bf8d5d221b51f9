//! Trip service front door: fare preview, trip creation, cancellation and
//! re-dispatch.
//!
//! Transport adapters (HTTP, gRPC) sit on top of `TripApiV1` and translate
//! `TripError::code()` into their own status codes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::model::{RideFare, Trip};
use super::pricing::PricingConfig;
use super::repository::{RepositoryError, TripRepository};
use super::route::{RouteError, RouteProvider};
use super::status::{transition, TransitionError, TripEvent, TripStatus};
use crate::bus::{BusError, MessageBus};
use crate::contracts::events::{Coordinate, Route, TripEventData};
use crate::contracts::{Envelope, TRIP_EVENT_CREATED};

/// Reads before giving up on a cancel that keeps racing saga steps.
const CANCEL_ATTEMPTS: usize = 3;

/// Client-facing error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    Unimplemented,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum TripError {
    #[error("Fare {fare_id} does not belong to user {user_id}")]
    FareOwnershipMismatch { fare_id: String, user_id: String },

    #[error("Trip {trip_id} does not belong to user {user_id}")]
    TripOwnershipMismatch { trip_id: String, user_id: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Failed to get route: {0}")]
    Route(#[from] RouteError),

    #[error("Failed to publish event: {0}")]
    Publish(#[from] BusError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

impl TripError {
    /// Error class to report to the caller. Retry and broker details stay internal.
    pub fn code(&self) -> ErrorCode {
        match self {
            TripError::FareOwnershipMismatch { .. } | TripError::TripOwnershipMismatch { .. } => {
                ErrorCode::PermissionDenied
            }
            TripError::Repository(RepositoryError::NotFound { .. }) => ErrorCode::NotFound,
            TripError::Transition(_)
            | TripError::Repository(RepositoryError::StatusConflict { .. }) => {
                ErrorCode::FailedPrecondition
            }
            TripError::Route(RouteError::InvalidCoordinate { .. }) => ErrorCode::InvalidArgument,
            TripError::Unimplemented(_) => ErrorCode::Unimplemented,
            TripError::Repository(_)
            | TripError::Route(_)
            | TripError::Publish(_)
            | TripError::Encode(_) => ErrorCode::Internal,
        }
    }
}

/// Route plus one fare per vehicle package.
#[derive(Debug, Clone, PartialEq)]
pub struct TripPreview {
    pub route: Route,
    pub fares: Vec<RideFare>,
}

/// Versioned trip API. Every method defaults to `TripError::Unimplemented`,
/// so adapters written against an older version keep compiling.
#[async_trait]
pub trait TripApiV1: Send + Sync {
    async fn preview_trip(
        &self,
        _user_id: &str,
        _pickup: Coordinate,
        _destination: Coordinate,
    ) -> Result<TripPreview, TripError> {
        Err(TripError::Unimplemented("preview_trip"))
    }

    async fn create_trip(&self, _fare_id: &str, _user_id: &str) -> Result<Trip, TripError> {
        Err(TripError::Unimplemented("create_trip"))
    }

    async fn get_trip(&self, _trip_id: &str, _user_id: &str) -> Result<Trip, TripError> {
        Err(TripError::Unimplemented("get_trip"))
    }

    async fn cancel_trip(&self, _trip_id: &str, _user_id: &str) -> Result<Trip, TripError> {
        Err(TripError::Unimplemented("cancel_trip"))
    }

    async fn redispatch_trip(&self, _trip_id: &str, _user_id: &str) -> Result<Trip, TripError> {
        Err(TripError::Unimplemented("redispatch_trip"))
    }
}

/// No-op adapter answering `Unimplemented` to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnimplementedTripApi;

impl TripApiV1 for UnimplementedTripApi {}

/// Trip service backed by a repository, a route provider and the bus.
pub struct TripService {
    repo: Arc<dyn TripRepository>,
    routes: Arc<dyn RouteProvider>,
    bus: Arc<dyn MessageBus>,
    pricing: PricingConfig,
}

impl TripService {
    pub fn new(
        repo: Arc<dyn TripRepository>,
        routes: Arc<dyn RouteProvider>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            repo,
            routes,
            bus,
            pricing: PricingConfig::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    async fn owned_trip(&self, trip_id: &str, user_id: &str) -> Result<Trip, TripError> {
        let trip = self.repo.get_trip(trip_id).await?;
        if trip.user_id != user_id {
            return Err(TripError::TripOwnershipMismatch {
                trip_id: trip_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(trip)
    }

    /// Announce that `trip` needs a driver.
    async fn publish_trip_created(&self, trip: &Trip) -> Result<(), TripError> {
        let data = TripEventData {
            trip: trip.snapshot(),
        };
        let envelope = Envelope::targeted(trip.user_id.clone(), &data)?;
        self.bus.publish(TRIP_EVENT_CREATED, &envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl TripApiV1 for TripService {
    async fn preview_trip(
        &self,
        user_id: &str,
        pickup: Coordinate,
        destination: Coordinate,
    ) -> Result<TripPreview, TripError> {
        let route = self.routes.route(pickup, destination).await?;
        let fares = self.pricing.estimate_fares(user_id, &route);
        for fare in &fares {
            self.repo.save_fare(fare.clone()).await?;
        }

        info!(
            user_id = %user_id,
            distance_m = route.distance,
            fares = fares.len(),
            "Trip preview generated"
        );
        Ok(TripPreview { route, fares })
    }

    async fn create_trip(&self, fare_id: &str, user_id: &str) -> Result<Trip, TripError> {
        let fare = self.repo.get_fare(fare_id).await?;
        if fare.user_id != user_id {
            return Err(TripError::FareOwnershipMismatch {
                fare_id: fare_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        let trip = self.repo.create_trip(Trip::new(fare)).await?;
        self.publish_trip_created(&trip).await?;

        info!(trip_id = %trip.id, user_id = %user_id, package = %trip.fare.package_slug, "Trip created");
        Ok(trip)
    }

    async fn get_trip(&self, trip_id: &str, user_id: &str) -> Result<Trip, TripError> {
        self.owned_trip(trip_id, user_id).await
    }

    async fn cancel_trip(&self, trip_id: &str, user_id: &str) -> Result<Trip, TripError> {
        let mut trip = self.owned_trip(trip_id, user_id).await?;
        let mut attempt = 1;
        loop {
            let next = transition(trip.status, TripEvent::Cancel)?;
            match self.repo.update_trip(trip_id, trip.status, next, None).await {
                Ok(cancelled) => {
                    info!(trip_id = %trip_id, from = %trip.status, "Trip cancelled");
                    return Ok(cancelled);
                }
                Err(RepositoryError::StatusConflict { actual, .. }) if attempt < CANCEL_ATTEMPTS => {
                    debug!(trip_id = %trip_id, %actual, attempt, "Trip changed while cancelling");
                    trip = self.repo.get_trip(trip_id).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn redispatch_trip(&self, trip_id: &str, user_id: &str) -> Result<Trip, TripError> {
        let trip = self.owned_trip(trip_id, user_id).await?;
        let next = transition(trip.status, TripEvent::Redispatch)?;
        self.repo.reset_dispatch_round(trip_id).await?;
        let trip = self.repo.update_trip(trip_id, trip.status, next, None).await?;

        if let Err(err) = self.publish_trip_created(&trip).await {
            // Nothing announced the round, so no saga step owns the trip yet.
            // Put it back where the rider can ask again.
            if let Err(revert) = self
                .repo
                .update_trip(trip_id, next, TripStatus::NoDrivers, None)
                .await
            {
                warn!(trip_id = %trip_id, error = %revert, "Failed to revert re-dispatch");
            }
            return Err(err);
        }

        info!(trip_id = %trip_id, "Trip re-dispatched");
        Ok(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;
    use crate::contracts::events::DriverInfo;
    use crate::trip::repository::Result as RepoResult;
    use crate::trip::{InMemoryTripRepository, StraightLineRouteProvider};

    fn coord(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate {
            latitude,
            longitude,
        }
    }

    fn service() -> (TripService, Arc<InMemoryTripRepository>, Arc<MockBus>) {
        let repo = Arc::new(InMemoryTripRepository::new());
        let bus = Arc::new(MockBus::new());
        let service = TripService::new(
            repo.clone(),
            Arc::new(StraightLineRouteProvider::default()),
            bus.clone(),
        );
        (service, repo, bus)
    }

    /// Saga steps up to `no_drivers` after `d1` declined.
    async fn exhaust_candidates(repo: &InMemoryTripRepository, trip: &Trip) {
        repo.update_trip(&trip.id, TripStatus::Pending, TripStatus::Dispatching, None)
            .await
            .unwrap();
        repo.record_decline(&trip.id, "d1").await.unwrap();
        repo.update_trip(&trip.id, TripStatus::Dispatching, TripStatus::NoDrivers, None)
            .await
            .unwrap();
    }

    async fn preview_fare(service: &TripService, user_id: &str) -> RideFare {
        let preview = service
            .preview_trip(user_id, coord(12.95, 77.70), coord(12.96, 77.72))
            .await
            .unwrap();
        preview.fares[0].clone()
    }

    #[tokio::test]
    async fn test_preview_saves_every_fare() {
        let (service, repo, _) = service();
        let preview = service
            .preview_trip("rider-1", coord(12.95, 77.70), coord(12.96, 77.72))
            .await
            .unwrap();

        assert_eq!(preview.fares.len(), 4);
        for fare in &preview.fares {
            assert_eq!(repo.get_fare(&fare.id).await.unwrap(), *fare);
        }
    }

    #[tokio::test]
    async fn test_preview_rejects_bad_coordinates() {
        let (service, _, _) = service();
        let err = service
            .preview_trip("rider-1", coord(100.0, 0.0), coord(0.0, 0.0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_trip_publishes_trip_created_to_rider() {
        let (service, _, bus) = service();
        let fare = preview_fare(&service, "rider-1").await;

        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();
        assert_eq!(trip.status, TripStatus::Pending);

        let published = bus.published_with_key(TRIP_EVENT_CREATED).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].owner_id, "rider-1");
        let data: TripEventData = published[0].payload().unwrap();
        assert_eq!(data.trip.id, trip.id);
        assert_eq!(data.trip.selected_fare.id, fare.id);
    }

    #[tokio::test]
    async fn test_create_trip_with_someone_elses_fare() {
        let (service, _, bus) = service();
        let fare = preview_fare(&service, "rider-1").await;

        let err = service.create_trip(&fare.id, "rider-2").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_trip_unknown_fare() {
        let (service, _, _) = service();
        let err = service.create_trip("missing", "rider-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_create_trip_publish_failure_is_internal() {
        let (service, _, bus) = service();
        let fare = preview_fare(&service, "rider-1").await;
        bus.set_fail_on_publish(true).await;

        let err = service.create_trip(&fare.id, "rider-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_cancel_trip() {
        let (service, _, _) = service();
        let fare = preview_fare(&service, "rider-1").await;
        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();

        let cancelled = service.cancel_trip(&trip.id, "rider-1").await.unwrap();
        assert_eq!(cancelled.status, TripStatus::Cancelled);

        let err = service.cancel_trip(&trip.id, "rider-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_redispatch_requires_no_drivers() {
        let (service, repo, bus) = service();
        let fare = preview_fare(&service, "rider-1").await;
        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();

        let err = service.redispatch_trip(&trip.id, "rider-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        exhaust_candidates(&repo, &trip).await;

        let trip = service.redispatch_trip(&trip.id, "rider-1").await.unwrap();
        assert_eq!(trip.status, TripStatus::Dispatching);
        assert!(trip.declined_drivers.is_empty());
        assert_eq!(bus.published_with_key(TRIP_EVENT_CREATED).await.len(), 2);
    }

    #[tokio::test]
    async fn test_redispatch_can_be_retried_after_publish_failure() {
        let (service, repo, bus) = service();
        let fare = preview_fare(&service, "rider-1").await;
        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();
        exhaust_candidates(&repo, &trip).await;

        bus.fail_next_publishes(1).await;
        let err = service.redispatch_trip(&trip.id, "rider-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(
            repo.get_trip(&trip.id).await.unwrap().status,
            TripStatus::NoDrivers
        );

        let trip = service.redispatch_trip(&trip.id, "rider-1").await.unwrap();
        assert_eq!(trip.status, TripStatus::Dispatching);
        // One from creation, one from the successful re-dispatch.
        assert_eq!(bus.published_with_key(TRIP_EVENT_CREATED).await.len(), 2);
    }

    /// Moves the trip from pending to dispatching just before the first
    /// status write, as a saga step would between the caller's read and write.
    struct SagaRacingRepository {
        inner: InMemoryTripRepository,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TripRepository for SagaRacingRepository {
        async fn save_fare(&self, fare: RideFare) -> RepoResult<()> {
            self.inner.save_fare(fare).await
        }

        async fn get_fare(&self, fare_id: &str) -> RepoResult<RideFare> {
            self.inner.get_fare(fare_id).await
        }

        async fn create_trip(&self, trip: Trip) -> RepoResult<Trip> {
            self.inner.create_trip(trip).await
        }

        async fn get_trip(&self, trip_id: &str) -> RepoResult<Trip> {
            self.inner.get_trip(trip_id).await
        }

        async fn update_trip(
            &self,
            trip_id: &str,
            expected: TripStatus,
            status: TripStatus,
            driver: Option<DriverInfo>,
        ) -> RepoResult<Trip> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.inner
                    .update_trip(trip_id, TripStatus::Pending, TripStatus::Dispatching, None)
                    .await?;
            }
            self.inner.update_trip(trip_id, expected, status, driver).await
        }

        async fn set_requested_driver(
            &self,
            trip_id: &str,
            driver_id: Option<String>,
        ) -> RepoResult<Trip> {
            self.inner.set_requested_driver(trip_id, driver_id).await
        }

        async fn record_decline(
            &self,
            trip_id: &str,
            driver_id: &str,
        ) -> RepoResult<Trip> {
            self.inner.record_decline(trip_id, driver_id).await
        }

        async fn reset_dispatch_round(&self, trip_id: &str) -> RepoResult<Trip> {
            self.inner.reset_dispatch_round(trip_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_rereads_after_concurrent_status_change() {
        let repo = Arc::new(SagaRacingRepository {
            inner: InMemoryTripRepository::new(),
            raced: std::sync::atomic::AtomicBool::new(false),
        });
        let service = TripService::new(
            repo.clone(),
            Arc::new(StraightLineRouteProvider::default()),
            Arc::new(MockBus::new()),
        );
        let fare = preview_fare(&service, "rider-1").await;
        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();
        assert_eq!(trip.status, TripStatus::Pending);

        let cancelled = service.cancel_trip(&trip.id, "rider-1").await.unwrap();
        assert_eq!(cancelled.status, TripStatus::Cancelled);
        assert_eq!(
            repo.get_trip(&trip.id).await.unwrap().status,
            TripStatus::Cancelled
        );
    }

    #[test]
    fn test_status_conflict_is_a_failed_precondition() {
        let err = TripError::from(RepositoryError::StatusConflict {
            id: "t1".to_string(),
            expected: TripStatus::Dispatching,
            actual: TripStatus::Cancelled,
        });
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_get_trip_checks_owner() {
        let (service, _, _) = service();
        let fare = preview_fare(&service, "rider-1").await;
        let trip = service.create_trip(&fare.id, "rider-1").await.unwrap();

        assert_eq!(service.get_trip(&trip.id, "rider-1").await.unwrap().id, trip.id);
        let err = service.get_trip(&trip.id, "rider-2").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_unimplemented_adapter() {
        let api = UnimplementedTripApi;
        let err = api.create_trip("f", "u").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
        assert_eq!(err.to_string(), "create_trip is not implemented");
    }
}
