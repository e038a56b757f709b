//! Assignment of drivers to orders, and the real-time fan-out around it.
//!
//! Every assignment commits the order update, its ledger entry and the
//! driver's BUSY flip in one store transaction. Broadcasts and
//! notifications happen only after that commit and cannot undo it.

use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::directory::{self, DriverFilter};
use crate::engine::lifecycle::{self, AppliedTransition};
use crate::engine::queue::{DispatchJob, enqueue_order};
use crate::engine::scoring;
use crate::error::AppError;
use crate::events::{ConnectionId, DispatchEvent, Topic};
use crate::geo::{estimate_travel_minutes, haversine_km};
use crate::models::assignment::{AssignmentMode, AutoAssignment, DispatchCandidateScore};
use crate::models::driver::{Driver, DriverAvailability, DriverSummary, GeoPoint, VehicleType};
use crate::models::order::{Order, OrderStatus};
use crate::notify::{NotificationKind, UserType, notify_detached};
use crate::state::AppState;
use crate::store::StoreTransaction;

/// Why a single auto-assign commit attempt failed.
enum CommitError {
    /// The driver can't take the order; the next candidate may.
    Driver(AppError),
    /// The order itself is no longer assignable, or the store failed.
    Order(AppError),
}

impl From<crate::store::StoreError> for CommitError {
    fn from(err: crate::store::StoreError) -> Self {
        CommitError::Order(err.into())
    }
}

pub async fn assign_driver(state: &AppState, order_id: Uuid, driver_id: Uuid) -> Result<Order, AppError> {
    let result = assign_manually(state, order_id, driver_id).await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    state
        .metrics
        .assignments_total
        .with_label_values(&[AssignmentMode::Manual.as_str(), outcome])
        .inc();

    let (applied, driver) = match result? {
        Assignment::Unchanged(order) => return Ok(order),
        Assignment::Committed(applied, driver) => (applied, driver),
    };

    let distance_km = driver
        .location
        .map(|location| haversine_km(&location, &applied.order.pickup.location));
    announce_assignment(state, &applied, &driver, distance_km).await;

    Ok(applied.order)
}

enum Assignment {
    Unchanged(Order),
    Committed(AppliedTransition, Driver),
}

async fn assign_manually(state: &AppState, order_id: Uuid, driver_id: Uuid) -> Result<Assignment, AppError> {
    let mut tx = state.store.begin().await?;
    let order = tx
        .order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    // Retrying a successful call must not assign twice.
    if order.driver_id == Some(driver_id) && order.status == OrderStatus::DriverAssigned {
        return Ok(Assignment::Unchanged(order));
    }
    if let Some(existing) = order.driver_id {
        return Err(AppError::Conflict(format!(
            "order {order_id} already assigned to driver {existing}"
        )));
    }
    if !order.status.is_assignable() {
        return Err(AppError::InvalidTransition {
            from: order.status,
            to: OrderStatus::DriverAssigned,
        });
    }

    let driver = tx
        .driver(driver_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
    if driver.availability != DriverAvailability::Available {
        return Err(AppError::Conflict(format!(
            "driver {driver_id} is {:?}, not available",
            driver.availability
        )));
    }

    let (applied, driver) = stage_assignment(tx.as_mut(), order, driver).await?;
    tx.commit().await?;

    Ok(Assignment::Committed(applied, driver))
}

/// Ranks nearby candidates and commits to the best one that can still
/// take the order. Alternates are informational and not reserved.
pub async fn auto_assign_driver(state: &AppState, order_id: Uuid) -> Result<AutoAssignment, AppError> {
    let start = Instant::now();
    let result = auto_assign(state, order_id).await;

    let outcome = if result.is_ok() { "success" } else { "failure" };
    state
        .metrics
        .dispatch_latency_seconds
        .with_label_values(&[outcome])
        .observe(start.elapsed().as_secs_f64());
    state
        .metrics
        .assignments_total
        .with_label_values(&[AssignmentMode::Auto.as_str(), outcome])
        .inc();

    result
}

async fn auto_assign(state: &AppState, order_id: Uuid) -> Result<AutoAssignment, AppError> {
    let order = lifecycle::get_order(state, order_id).await?;
    if let Some(existing) = order.driver_id {
        return Err(AppError::Conflict(format!(
            "order {order_id} already assigned to driver {existing}"
        )));
    }
    if !order.status.is_assignable() {
        return Err(AppError::InvalidTransition {
            from: order.status,
            to: OrderStatus::DriverAssigned,
        });
    }

    let ranked = ranked_candidates(state, order.pickup.location, state.config.dispatch_radius_km).await?;
    if ranked.is_empty() {
        warn!(order_id = %order_id, "no eligible drivers in range");
        return Err(AppError::NoAvailableDrivers);
    }

    for (position, candidate) in ranked.iter().enumerate() {
        match try_commit(state, order_id, candidate.driver_id).await {
            Ok((applied, driver)) => {
                announce_assignment(state, &applied, &driver, Some(candidate.distance_km)).await;

                info!(
                    order_id = %order_id,
                    driver_id = %candidate.driver_id,
                    score = candidate.score,
                    distance_km = candidate.distance_km,
                    "order auto-assigned"
                );

                return Ok(AutoAssignment {
                    order: applied.order,
                    assigned_driver: candidate.clone(),
                    alternates: ranked
                        .iter()
                        .skip(position + 1)
                        .take(state.config.alternates)
                        .cloned()
                        .collect(),
                    assigned_at: applied.entry.recorded_at,
                });
            }
            Err(CommitError::Driver(err)) => {
                debug!(
                    order_id = %order_id,
                    driver_id = %candidate.driver_id,
                    error = %err,
                    "candidate rejected at commit; trying next"
                );
            }
            Err(CommitError::Order(err)) => return Err(err),
        }
    }

    warn!(order_id = %order_id, candidates = ranked.len(), "every candidate was taken");
    Err(AppError::NoAvailableDrivers)
}

async fn try_commit(
    state: &AppState,
    order_id: Uuid,
    driver_id: Uuid,
) -> Result<(AppliedTransition, Driver), CommitError> {
    let mut tx = state.store.begin().await?;

    // Re-read under the transaction: another dispatcher may have won.
    let order = tx
        .order(order_id)
        .await?
        .ok_or_else(|| CommitError::Order(AppError::NotFound(format!("order {order_id} not found"))))?;
    if let Some(existing) = order.driver_id {
        return Err(CommitError::Order(AppError::Conflict(format!(
            "order {order_id} already assigned to driver {existing}"
        ))));
    }
    if !order.status.is_assignable() {
        return Err(CommitError::Order(AppError::InvalidTransition {
            from: order.status,
            to: OrderStatus::DriverAssigned,
        }));
    }

    let driver = tx
        .driver(driver_id)
        .await?
        .ok_or_else(|| CommitError::Driver(AppError::NotFound(format!("driver {driver_id} not found"))))?;
    let eligible = driver.verified
        && matches!(
            driver.availability,
            DriverAvailability::Available | DriverAvailability::Busy
        );
    if !eligible {
        return Err(CommitError::Driver(AppError::Conflict(format!(
            "driver {driver_id} is no longer eligible"
        ))));
    }

    // Ranking used a snapshot; the driver may have moved since.
    let in_range = driver.location.is_some_and(|location| {
        haversine_km(&location, &order.pickup.location) <= state.config.dispatch_radius_km
    });
    if !in_range {
        return Err(CommitError::Driver(AppError::Conflict(format!(
            "driver {driver_id} is no longer within range of the pickup"
        ))));
    }

    let active = tx.count_active_orders(driver_id).await?;
    if active >= state.config.max_active_orders_per_driver {
        return Err(CommitError::Driver(AppError::Conflict(format!(
            "driver {driver_id} already holds {active} order(s)"
        ))));
    }

    let (applied, driver) = stage_assignment(tx.as_mut(), order, driver)
        .await
        .map_err(CommitError::Order)?;
    tx.commit().await?;

    Ok((applied, driver))
}

async fn stage_assignment(
    tx: &mut dyn StoreTransaction,
    mut order: Order,
    driver: Driver,
) -> Result<(AppliedTransition, Driver), AppError> {
    order.driver_id = Some(driver.id);
    let note = Some(format!("assigned to driver {}", driver.id));
    let applied = lifecycle::apply_transition(tx, order, OrderStatus::DriverAssigned, note, None).await?;
    let driver = directory::mark_busy(tx, driver).await?;

    Ok((applied, driver))
}

async fn ranked_candidates(
    state: &AppState,
    pickup: GeoPoint,
    radius_km: f64,
) -> Result<Vec<DispatchCandidateScore>, AppError> {
    let candidates = directory::find_dispatch_candidates(state, pickup, radius_km).await?;

    Ok(scoring::rank(
        candidates
            .into_iter()
            .map(|candidate| {
                scoring::score_candidate(
                    candidate.driver.id,
                    candidate.distance_km,
                    candidate.active_order_count,
                    candidate.driver.rating,
                    eta(state, candidate.distance_km),
                )
            })
            .collect(),
    ))
}

fn eta(state: &AppState, distance_km: f64) -> u32 {
    estimate_travel_minutes(
        distance_km,
        state.config.average_speed_kmh,
        state.config.eta_buffer_factor,
    )
}

async fn announce_assignment(
    state: &AppState,
    applied: &AppliedTransition,
    driver: &Driver,
    distance_km: Option<f64>,
) {
    lifecycle::announce_transition(state, applied).await;

    let order = &applied.order;
    state.broadcaster.publish_all(
        &[
            Topic::Order(order.id),
            Topic::Customer(order.customer_id),
            Topic::Driver(driver.id),
        ],
        &DispatchEvent::DriverAssigned {
            order_id: order.id,
            driver_id: driver.id,
            distance_km,
            eta_minutes: distance_km.map(|distance| eta(state, distance)),
            assigned_at: applied.entry.recorded_at,
        },
    );

    let payload = json!({ "order_id": order.id, "driver_id": driver.id });
    notify_detached(
        &state.notifier,
        driver.id,
        UserType::Driver,
        NotificationKind::DriverAssigned,
        payload.clone(),
    );
    notify_detached(
        &state.notifier,
        order.customer_id,
        UserType::Customer,
        NotificationKind::DriverAssigned,
        payload,
    );
}

/// Tells the nearest eligible drivers that a paid order is waiting, and
/// queues it for background dispatch when that is enabled.
pub async fn offer_order(state: &AppState, order: &Order) -> Result<usize, AppError> {
    let ranked = ranked_candidates(state, order.pickup.location, state.config.dispatch_radius_km).await?;

    let mut offered = 0;
    for candidate in ranked.iter().take(state.config.order_available_fanout) {
        offered += state.broadcaster.publish(
            Topic::Driver(candidate.driver_id),
            &DispatchEvent::OrderAvailable {
                order_id: order.id,
                pickup: order.pickup.location,
                distance_km: candidate.distance_km,
                eta_minutes: candidate.eta_minutes,
            },
        );
    }

    if state.config.auto_dispatch {
        enqueue_order(state, DispatchJob::new(order.id))?;
    }

    debug!(order_id = %order.id, offered, "order offered to drivers");
    Ok(offered)
}

pub async fn update_driver_location(
    state: &AppState,
    driver_id: Uuid,
    lat: f64,
    lng: f64,
) -> Result<Driver, AppError> {
    let location = GeoPoint { lat, lng };
    let driver = directory::update_location(state, driver_id, location).await?;

    let event = DispatchEvent::LocationUpdate {
        driver_id,
        location,
        recorded_at: driver.location_updated_at.unwrap_or_else(Utc::now),
    };
    state.broadcaster.publish(Topic::Driver(driver_id), &event);

    match state.store.active_orders_for_driver(driver_id).await {
        Ok(orders) => {
            let topics: Vec<Topic> = orders.iter().map(|order| Topic::Order(order.id)).collect();
            state.broadcaster.publish_all(&topics, &event);
        }
        Err(err) => {
            warn!(driver_id = %driver_id, error = %err, "skipping order channels for location update");
        }
    }

    Ok(driver)
}

pub async fn find_nearby_drivers(
    state: &AppState,
    lat: f64,
    lng: f64,
    radius_km: Option<f64>,
    vehicle_type: Option<VehicleType>,
) -> Result<Vec<DriverSummary>, AppError> {
    directory::find_available_near(
        state,
        GeoPoint { lat, lng },
        radius_km.unwrap_or(state.config.nearby_radius_km),
        DriverFilter { vehicle_type },
    )
    .await
}

pub async fn subscribe_to_order(
    state: &AppState,
    connection_id: ConnectionId,
    order_id: Uuid,
) -> Result<(), AppError> {
    lifecycle::get_order(state, order_id).await?;

    if state.broadcaster.subscribe(connection_id, Topic::Order(order_id)) {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("connection {connection_id} not found")))
    }
}

pub fn unsubscribe_from_order(state: &AppState, connection_id: ConnectionId, order_id: Uuid) -> bool {
    state.broadcaster.unsubscribe(connection_id, Topic::Order(order_id))
}
