//! Payload schemas carried in `Envelope::data`.
//!
//! Services never share live trip state; they exchange these snapshots.

use serde::{Deserialize, Serialize};

/// Geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Polyline of a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub coordinates: Vec<Coordinate>,
}

/// Driving route between pickup and destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Meters.
    pub distance: f64,
    /// Seconds.
    pub duration: f64,
    pub geometry: Vec<Geometry>,
}

/// Fare as seen by other services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideFareSnapshot {
    pub id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub package_slug: String,
    pub total_price_in_cents: f64,
}

/// Driver details attached to responses and assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    pub profile_picture: String,
    pub car_plate: String,
    pub package_slug: String,
}

/// Serialized view of a trip at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSnapshot {
    pub id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub status: String,
    pub selected_fare: RideFareSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverInfo>,
}

/// Payload of trip-created, trip-driver-not-interested, trip-no-drivers-found,
/// trip-driver-assigned and driver-cmd-trip-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEventData {
    pub trip: TripSnapshot,
}

/// Payload of driver-cmd-trip-accept / driver-cmd-trip-decline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverTripResponseData {
    pub driver: DriverInfo,
    #[serde(rename = "tripID")]
    pub trip_id: String,
    #[serde(rename = "riderID")]
    pub rider_id: String,
}

/// Payload of payment-cmd-create-session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTripResponseData {
    #[serde(rename = "tripID")]
    pub trip_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "driverID")]
    pub driver_id: String,
    pub amount: f64,
    pub currency: String,
}

/// Payload of payment-event-session-created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEventSessionCreatedData {
    #[serde(rename = "tripID")]
    pub trip_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub amount: f64,
    pub currency: String,
}

/// Payload of payment-event-success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusUpdateData {
    #[serde(rename = "tripID")]
    pub trip_id: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "driverID")]
    pub driver_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trip_snapshot_json_shape() {
        let data = TripEventData {
            trip: TripSnapshot {
                id: "t1".to_string(),
                user_id: "u1".to_string(),
                status: "pending".to_string(),
                selected_fare: RideFareSnapshot {
                    id: "f1".to_string(),
                    user_id: "u1".to_string(),
                    package_slug: "suv".to_string(),
                    total_price_in_cents: 1250.0,
                },
                route: None,
                driver: None,
            },
        };

        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["trip"]["userID"], "u1");
        assert_eq!(value["trip"]["selectedFare"]["packageSlug"], "suv");
        assert!(value["trip"].get("driver").is_none());
    }

    #[test]
    fn test_driver_response_decodes_go_field_names() {
        let raw = json!({
            "driver": { "id": "d1", "name": "Ana", "profilePicture": "", "carPlate": "XYZ", "packageSlug": "sedan" },
            "tripID": "t1",
            "riderID": "u1"
        });
        let data: DriverTripResponseData = serde_json::from_value(raw).unwrap();
        assert_eq!(data.driver.car_plate, "XYZ");
        assert_eq!(data.trip_id, "t1");
        assert_eq!(data.rider_id, "u1");
    }
}
