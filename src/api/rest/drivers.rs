use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::coordinator;
use crate::engine::directory::{self, RegisterDriver};
use crate::error::AppError;
use crate::models::driver::{Driver, DriverSummary, VehicleType};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver))
        .route("/drivers/nearby", get(nearby_drivers))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/availability", patch(update_availability))
        .route("/drivers/:id/break", post(start_break))
        .route("/drivers/:id/location", patch(update_location))
}

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: Option<f64>,
    pub vehicle_type: Option<VehicleType>,
}

#[derive(Serialize)]
pub struct LocationAck {
    pub driver_id: Uuid,
    pub acknowledged: bool,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriver>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(directory::register_driver(&state, payload).await?))
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverSummary>, AppError> {
    Ok(Json(directory::summary(&state, id).await?))
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<DriverSummary>>, AppError> {
    let drivers = coordinator::find_nearby_drivers(
        &state,
        query.lat,
        query.lng,
        query.radius_km,
        query.vehicle_type,
    )
    .await?;

    Ok(Json(drivers))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(directory::set_availability(&state, id, payload.available).await?))
}

async fn start_break(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(directory::start_break(&state, id).await?))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<LocationAck>, AppError> {
    coordinator::update_driver_location(&state, id, payload.lat, payload.lng).await?;

    Ok(Json(LocationAck {
        driver_id: id,
        acknowledged: true,
    }))
}
