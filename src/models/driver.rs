use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverAvailability {
    Available,
    Busy,
    Offline,
    OnBreak,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bicycle,
    Motorcycle,
    Car,
    Van,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub vehicle_type: VehicleType,
    pub availability: DriverAvailability,
    pub location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub rating: f64,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A driver as returned by the directory, with its derived workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSummary {
    pub id: Uuid,
    pub name: String,
    pub vehicle_type: VehicleType,
    pub availability: DriverAvailability,
    pub location: Option<GeoPoint>,
    pub rating: f64,
    pub verified: bool,
    pub active_order_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
}

impl DriverSummary {
    pub fn from_driver(driver: &Driver, active_order_count: usize) -> Self {
        Self {
            id: driver.id,
            name: driver.name.clone(),
            vehicle_type: driver.vehicle_type,
            availability: driver.availability,
            location: driver.location,
            rating: driver.rating,
            verified: driver.verified,
            active_order_count,
            distance_km: None,
            eta_minutes: None,
        }
    }
}
