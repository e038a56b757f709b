use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::{BoundingBox, estimate_travel_minutes, haversine_km, is_valid_coordinate};
use crate::models::driver::{Driver, DriverAvailability, DriverSummary, GeoPoint, VehicleType};
use crate::state::AppState;
use crate::store::{DriverQuery, StoreTransaction};

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterDriver {
    pub name: String,
    pub vehicle_type: VehicleType,
    pub rating: f64,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Start in AVAILABLE instead of OFFLINE.
    #[serde(default)]
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DriverFilter {
    pub vehicle_type: Option<VehicleType>,
}

/// A driver within reach of a pickup, before scoring.
#[derive(Debug, Clone)]
pub struct NearbyDriver {
    pub driver: Driver,
    pub distance_km: f64,
    pub active_order_count: usize,
}

pub fn validate_point(point: &GeoPoint) -> Result<(), AppError> {
    if is_valid_coordinate(point.lat, point.lng) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "invalid coordinate ({}, {})",
            point.lat, point.lng
        )))
    }
}

pub async fn register_driver(state: &AppState, request: RegisterDriver) -> Result<Driver, AppError> {
    if request.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    if let Some(location) = &request.location {
        validate_point(location)?;
    }

    let now = Utc::now();
    let driver = Driver {
        id: Uuid::new_v4(),
        name: request.name.trim().to_string(),
        vehicle_type: request.vehicle_type,
        availability: if request.available {
            DriverAvailability::Available
        } else {
            DriverAvailability::Offline
        },
        location: request.location,
        location_updated_at: request.location.map(|_| now),
        rating: if request.rating.is_nan() {
            0.0
        } else {
            request.rating.clamp(0.0, 5.0)
        },
        verified: request.verified,
        created_at: now,
        updated_at: now,
    };

    state.store.insert_driver(driver.clone()).await?;
    info!(driver_id = %driver.id, availability = ?driver.availability, "driver registered");

    Ok(driver)
}

pub async fn get(state: &AppState, id: Uuid) -> Result<Driver, AppError> {
    state
        .store
        .get_driver(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))
}

pub async fn summary(state: &AppState, id: Uuid) -> Result<DriverSummary, AppError> {
    let driver = get(state, id).await?;
    let active_order_count = state.store.count_active_orders(id).await?;
    Ok(DriverSummary::from_driver(&driver, active_order_count))
}

/// Drivers that could take a new order right now, nearest first.
pub async fn find_available_near(
    state: &AppState,
    center: GeoPoint,
    radius_km: f64,
    filter: DriverFilter,
) -> Result<Vec<DriverSummary>, AppError> {
    let nearby = query_within(
        state,
        center,
        radius_km,
        DriverQuery::new()
            .with_availability(&[DriverAvailability::Available])
            .with_vehicle_type(filter.vehicle_type),
    )
    .await?;

    Ok(nearby
        .into_iter()
        .map(|candidate| {
            let mut summary =
                DriverSummary::from_driver(&candidate.driver, candidate.active_order_count);
            summary.distance_km = Some(candidate.distance_km);
            summary.eta_minutes = Some(estimate_travel_minutes(
                candidate.distance_km,
                state.config.average_speed_kmh,
                state.config.eta_buffer_factor,
            ));
            summary
        })
        .collect())
}

/// Dispatch candidates: AVAILABLE drivers plus BUSY drivers that still
/// have room under the configured per-driver order cap.
pub async fn find_dispatch_candidates(
    state: &AppState,
    center: GeoPoint,
    radius_km: f64,
) -> Result<Vec<NearbyDriver>, AppError> {
    let nearby = query_within(
        state,
        center,
        radius_km,
        DriverQuery::new().with_availability(&[DriverAvailability::Available, DriverAvailability::Busy]),
    )
    .await?;

    Ok(nearby
        .into_iter()
        .filter(|candidate| candidate.active_order_count < state.config.max_active_orders_per_driver)
        .collect())
}

async fn query_within(
    state: &AppState,
    center: GeoPoint,
    radius_km: f64,
    query: DriverQuery,
) -> Result<Vec<NearbyDriver>, AppError> {
    validate_point(&center)?;
    if !(radius_km > 0.0) {
        return Err(AppError::BadRequest("radius must be > 0".to_string()));
    }

    let query = query
        .verified()
        .located()
        .within(BoundingBox::around(&center, radius_km));
    let drivers = state.store.list_drivers(&query).await?;

    let mut nearby = Vec::with_capacity(drivers.len());
    for driver in drivers {
        let Some(location) = driver.location else {
            continue;
        };
        let distance_km = haversine_km(&center, &location);
        if distance_km > radius_km {
            continue;
        }

        let active_order_count = state.store.count_active_orders(driver.id).await?;
        nearby.push(NearbyDriver {
            driver,
            distance_km,
            active_order_count,
        });
    }

    nearby.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.driver.id.cmp(&b.driver.id))
    });

    Ok(nearby)
}

/// Going offline is refused while the driver still holds unresolved orders.
pub async fn set_availability(state: &AppState, id: Uuid, available: bool) -> Result<Driver, AppError> {
    let target = if available {
        DriverAvailability::Available
    } else {
        DriverAvailability::Offline
    };
    change_availability(state, id, target).await
}

pub async fn start_break(state: &AppState, id: Uuid) -> Result<Driver, AppError> {
    change_availability(state, id, DriverAvailability::OnBreak).await
}

async fn change_availability(
    state: &AppState,
    id: Uuid,
    target: DriverAvailability,
) -> Result<Driver, AppError> {
    let mut tx = state.store.begin().await?;
    let mut driver = tx
        .driver(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;
    let active = tx.count_active_orders(id).await?;

    let availability = match target {
        DriverAvailability::Offline | DriverAvailability::OnBreak if active > 0 => {
            return Err(AppError::Conflict(format!(
                "driver {id} still holds {active} unresolved order(s)"
            )));
        }
        DriverAvailability::Available if active > 0 => DriverAvailability::Busy,
        other => other,
    };

    let previous = driver.availability;
    driver.availability = availability;
    driver.updated_at = Utc::now();
    tx.put_driver(driver.clone()).await?;
    tx.commit().await?;

    info!(
        driver_id = %id,
        from = ?previous,
        to = ?availability,
        "driver availability changed"
    );

    Ok(driver)
}

pub async fn update_location(state: &AppState, id: Uuid, location: GeoPoint) -> Result<Driver, AppError> {
    validate_point(&location)?;

    let mut tx = state.store.begin().await?;
    let mut driver = tx
        .driver(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

    let now = Utc::now();
    driver.location = Some(location);
    driver.location_updated_at = Some(now);
    driver.updated_at = now;
    tx.put_driver(driver.clone()).await?;
    tx.commit().await?;

    Ok(driver)
}

/// Stages the BUSY flip inside the caller's transaction. A driver that is
/// already BUSY is left as is.
pub async fn mark_busy(tx: &mut dyn StoreTransaction, mut driver: Driver) -> Result<Driver, AppError> {
    if driver.availability != DriverAvailability::Busy {
        driver.availability = DriverAvailability::Busy;
        driver.updated_at = Utc::now();
        tx.put_driver(driver.clone()).await?;
    }
    Ok(driver)
}

/// Stages a flip back to AVAILABLE once the driver's last unresolved order
/// is gone. Returns whether the driver was released.
pub async fn mark_available(tx: &mut dyn StoreTransaction, driver_id: Uuid) -> Result<bool, AppError> {
    let Some(mut driver) = tx.driver(driver_id).await? else {
        return Ok(false);
    };
    if driver.availability != DriverAvailability::Busy {
        return Ok(false);
    }
    if tx.count_active_orders(driver_id).await? > 0 {
        return Ok(false);
    }

    driver.availability = DriverAvailability::Available;
    driver.updated_at = Utc::now();
    tx.put_driver(driver).await?;
    Ok(true)
}
