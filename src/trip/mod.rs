//! Trip service: fares, trips, and the trip lifecycle.

mod model;
mod pricing;
mod repository;
mod route;
mod service;
mod status;

pub use model::{RideFare, Trip};
pub use pricing::{PricingConfig, VehiclePackage};
pub use repository::{InMemoryTripRepository, RepositoryError, TripRepository};
pub use route::{haversine_distance, RouteError, RouteProvider, StraightLineRouteProvider};
pub use service::{ErrorCode, TripApiV1, TripError, TripPreview, TripService, UnimplementedTripApi};
pub use status::{transition, TransitionError, TripEvent, TripStatus};
