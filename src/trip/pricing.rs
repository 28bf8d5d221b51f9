//! Fare estimation per vehicle package.

use crate::contracts::events::Route;

use super::model::RideFare;

/// Vehicle packages offered to riders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehiclePackage {
    Sedan,
    Suv,
    Van,
    Luxury,
}

impl VehiclePackage {
    pub const ALL: [VehiclePackage; 4] = [
        VehiclePackage::Sedan,
        VehiclePackage::Suv,
        VehiclePackage::Van,
        VehiclePackage::Luxury,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            VehiclePackage::Sedan => "sedan",
            VehiclePackage::Suv => "suv",
            VehiclePackage::Van => "van",
            VehiclePackage::Luxury => "luxury",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.slug() == slug)
    }

    /// Flat price before distance and time, in cents.
    pub fn base_fare_cents(&self) -> f64 {
        match self {
            VehiclePackage::Sedan => 350.0,
            VehiclePackage::Suv => 400.0,
            VehiclePackage::Van => 440.0,
            VehiclePackage::Luxury => 1000.0,
        }
    }
}

/// Distance and time rates, in cents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingConfig {
    pub cents_per_km: f64,
    pub cents_per_minute: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cents_per_km: 150.0,
            cents_per_minute: 25.0,
        }
    }
}

impl PricingConfig {
    /// Total price of `package` over `route`, rounded to whole cents.
    pub fn price(&self, package: VehiclePackage, route: &Route) -> f64 {
        let distance_km = route.distance / 1000.0;
        let duration_min = route.duration / 60.0;
        let total = package.base_fare_cents()
            + distance_km * self.cents_per_km
            + duration_min * self.cents_per_minute;
        total.round()
    }

    /// One fresh fare per package for `user_id`.
    pub fn estimate_fares(&self, user_id: &str, route: &Route) -> Vec<RideFare> {
        VehiclePackage::ALL
            .iter()
            .map(|package| {
                RideFare::new(
                    user_id,
                    package.slug(),
                    self.price(*package, route),
                    Some(route.clone()),
                )
            })
            .collect()
    }
}
