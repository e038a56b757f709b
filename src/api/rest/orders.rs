use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{coordinator, lifecycle};
use crate::engine::lifecycle::{CreateOrder, TransitionRequest};
use crate::error::AppError;
use crate::events::Topic;
use crate::models::assignment::AutoAssignment;
use crate::models::order::{Order, StatusHistoryEntry};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/history", get(order_history))
        .route("/orders/:id/status", post(transition_status))
        .route("/orders/:id/assign", post(assign_driver))
        .route("/orders/:id/auto-assign", post(auto_assign_driver))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/events", get(order_events))
}

#[derive(Deserialize)]
pub struct AssignRequest {
    pub driver_id: Uuid,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrder>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(lifecycle::create_order(&state, payload).await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(lifecycle::get_order(&state, id).await?))
}

async fn order_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusHistoryEntry>>, AppError> {
    Ok(Json(lifecycle::order_history(&state, id).await?))
}

async fn transition_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(lifecycle::transition_status(&state, id, payload).await?))
}

async fn assign_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AssignRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(coordinator::assign_driver(&state, id, payload.driver_id).await?))
}

async fn auto_assign_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AutoAssignment>, AppError> {
    Ok(Json(coordinator::auto_assign_driver(&state, id).await?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelRequest>>,
) -> Result<Json<Order>, AppError> {
    let Json(request) = payload.unwrap_or_default();
    Ok(Json(lifecycle::cancel_order(&state, id, request.reason).await?))
}

/// Server-sent events for one order channel. The subscription lives as
/// long as the response stream.
async fn order_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    lifecycle::get_order(&state, id).await?;

    let subscription = state.broadcaster.connect(Topic::Order(id));
    let stream = subscription.map(|envelope| {
        Event::default()
            .event(envelope.event.kind())
            .json_data(&envelope)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
