//! Online driver registry and the lookup the dispatch saga queries.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bus::{BusError, MessageBus};
use crate::contracts::events::{DriverInfo, DriverTripResponseData};
use crate::contracts::{Envelope, DRIVER_CMD_TRIP_ACCEPT, DRIVER_CMD_TRIP_DECLINE};

const PLATE_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Driver lookup unavailable: {0}")]
    Unavailable(String),
}

/// Finds drivers able to take a trip.
#[async_trait]
pub trait DriverLookup: Send + Sync {
    /// Ids of online drivers offering `package_slug`, in a stable order.
    async fn find_available_drivers(&self, package_slug: &str) -> Result<Vec<String>, LookupError>;
}

/// Three random uppercase letters.
pub fn random_plate() -> String {
    let mut rng = rand::rng();
    (0..3)
        .map(|_| PLATE_LETTERS[rng.random_range(0..PLATE_LETTERS.len())] as char)
        .collect()
}

fn random_avatar() -> String {
    let index = rand::rng().random_range(0..=9);
    format!("https://randomuser.me/api/portraits/lego/{}.jpg", index)
}

/// Drivers currently online, in registration order.
#[derive(Default)]
pub struct InMemoryDriverRegistry {
    drivers: RwLock<Vec<DriverInfo>>,
}

impl InMemoryDriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a driver online. Re-registering replaces the previous record.
    pub async fn register(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        package_slug: impl Into<String>,
    ) -> DriverInfo {
        let driver = DriverInfo {
            id: id.into(),
            name: name.into(),
            profile_picture: random_avatar(),
            car_plate: random_plate(),
            package_slug: package_slug.into(),
        };

        let mut drivers = self.drivers.write().await;
        match drivers.iter_mut().find(|d| d.id == driver.id) {
            Some(existing) => *existing = driver.clone(),
            None => drivers.push(driver.clone()),
        }

        info!(driver_id = %driver.id, package = %driver.package_slug, "Driver registered");
        driver
    }

    /// Take a driver offline. Returns the removed record.
    pub async fn unregister(&self, id: &str) -> Option<DriverInfo> {
        let mut drivers = self.drivers.write().await;
        let position = drivers.iter().position(|d| d.id == id)?;
        let driver = drivers.remove(position);
        info!(driver_id = %id, "Driver unregistered");
        Some(driver)
    }

    pub async fn get(&self, id: &str) -> Option<DriverInfo> {
        self.drivers.read().await.iter().find(|d| d.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.drivers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.drivers.read().await.is_empty()
    }
}

#[async_trait]
impl DriverLookup for InMemoryDriverRegistry {
    async fn find_available_drivers(&self, package_slug: &str) -> Result<Vec<String>, LookupError> {
        let ids: Vec<String> = self
            .drivers
            .read()
            .await
            .iter()
            .filter(|d| d.package_slug == package_slug)
            .map(|d| d.id.clone())
            .collect();
        debug!(package = %package_slug, found = ids.len(), "Driver lookup");
        Ok(ids)
    }
}

/// Publish a driver's answer to a trip request, as the driver-facing gateway does.
pub async fn publish_driver_response(
    bus: &Arc<dyn MessageBus>,
    driver: &DriverInfo,
    trip_id: &str,
    rider_id: &str,
    accepted: bool,
) -> Result<(), BusError> {
    let routing_key = if accepted {
        DRIVER_CMD_TRIP_ACCEPT
    } else {
        DRIVER_CMD_TRIP_DECLINE
    };
    let data = DriverTripResponseData {
        driver: driver.clone(),
        trip_id: trip_id.to_string(),
        rider_id: rider_id.to_string(),
    };
    let envelope = Envelope::targeted(driver.id.clone(), &data)?;
    bus.publish(routing_key, &envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBus;

    #[test]
    fn test_random_plate_shape() {
        for _ in 0..20 {
            let plate = random_plate();
            assert_eq!(plate.len(), 3);
            assert!(plate.chars().all(|c| c.is_ascii_uppercase()));
        }
    }

    #[tokio::test]
    async fn test_lookup_filters_by_package_in_registration_order() {
        let registry = InMemoryDriverRegistry::new();
        registry.register("d1", "Ana", "sedan").await;
        registry.register("d2", "Bo", "suv").await;
        registry.register("d3", "Cy", "sedan").await;

        let ids = registry.find_available_drivers("sedan").await.unwrap();
        assert_eq!(ids, vec!["d1", "d3"]);
        assert!(registry.find_available_drivers("van").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_twice_replaces() {
        let registry = InMemoryDriverRegistry::new();
        registry.register("d1", "Ana", "sedan").await;
        registry.register("d1", "Ana", "luxury").await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("d1").await.unwrap().package_slug, "luxury");
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = InMemoryDriverRegistry::new();
        registry.register("d1", "Ana", "sedan").await;

        assert!(registry.unregister("d1").await.is_some());
        assert!(registry.unregister("d1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_publish_driver_response_routing() {
        let mock = Arc::new(MockBus::new());
        let bus: Arc<dyn MessageBus> = mock.clone();
        let driver = DriverInfo {
            id: "d1".to_string(),
            ..Default::default()
        };

        publish_driver_response(&bus, &driver, "t1", "r1", true).await.unwrap();
        publish_driver_response(&bus, &driver, "t1", "r1", false).await.unwrap();

        let accepted = mock.published_with_key(DRIVER_CMD_TRIP_ACCEPT).await;
        assert_eq!(accepted.len(), 1);
        let data: DriverTripResponseData = accepted[0].payload().unwrap();
        assert_eq!(data.trip_id, "t1");
        assert_eq!(data.rider_id, "r1");
        assert_eq!(data.driver.id, "d1");
        assert_eq!(mock.published_with_key(DRIVER_CMD_TRIP_DECLINE).await.len(), 1);
    }
}
