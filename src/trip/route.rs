//! Route lookup between pickup and destination.

use async_trait::async_trait;

use crate::contracts::events::{Coordinate, Geometry, Route};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Invalid coordinate: ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("Route provider unavailable: {0}")]
    Unavailable(String),
}

/// Source of driving routes.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, pickup: Coordinate, destination: Coordinate) -> Result<Route, RouteError>;
}

/// Great-circle distance driven at a fixed average speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineRouteProvider {
    /// Meters per second.
    pub average_speed: f64,
}

impl Default for StraightLineRouteProvider {
    fn default() -> Self {
        // 30 km/h city average
        Self {
            average_speed: 30_000.0 / 3600.0,
        }
    }
}

fn validate(c: Coordinate) -> Result<Coordinate, RouteError> {
    let in_range = (-90.0..=90.0).contains(&c.latitude) && (-180.0..=180.0).contains(&c.longitude);
    if in_range {
        Ok(c)
    } else {
        Err(RouteError::InvalidCoordinate {
            latitude: c.latitude,
            longitude: c.longitude,
        })
    }
}

/// Haversine distance in meters.
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[async_trait]
impl RouteProvider for StraightLineRouteProvider {
    async fn route(&self, pickup: Coordinate, destination: Coordinate) -> Result<Route, RouteError> {
        let pickup = validate(pickup)?;
        let destination = validate(destination)?;

        let distance = haversine_distance(pickup, destination);
        let duration = if self.average_speed > 0.0 {
            distance / self.average_speed
        } else {
            0.0
        };

        Ok(Route {
            distance,
            duration,
            geometry: vec![Geometry {
                coordinates: vec![pickup, destination],
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate {
            latitude,
            longitude,
        }
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        let d = haversine_distance(coord(0.0, 0.0), coord(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0, "{}", d);
    }

    #[tokio::test]
    async fn test_straight_line_route() {
        let provider = StraightLineRouteProvider::default();
        let route = provider
            .route(coord(12.9550, 77.7010), coord(12.9635, 77.7185))
            .await
            .unwrap();

        assert!(route.distance > 1_500.0 && route.distance < 2_500.0, "{}", route.distance);
        assert!((route.duration - route.distance / provider.average_speed).abs() < 1e-6);
        assert_eq!(route.geometry[0].coordinates.len(), 2);
    }

    #[tokio::test]
    async fn test_same_point_is_zero_length() {
        let provider = StraightLineRouteProvider::default();
        let route = provider
            .route(coord(1.0, 1.0), coord(1.0, 1.0))
            .await
            .unwrap();
        assert_eq!(route.distance, 0.0);
        assert_eq!(route.duration, 0.0);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_coordinates() {
        let provider = StraightLineRouteProvider::default();
        let result = provider.route(coord(91.0, 0.0), coord(0.0, 0.0)).await;
        assert!(matches!(result, Err(RouteError::InvalidCoordinate { .. })));
    }
}
