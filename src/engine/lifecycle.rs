use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{coordinator, directory};
use crate::error::AppError;
use crate::events::{DispatchEvent, Topic};
use crate::models::driver::GeoPoint;
use crate::models::order::{Order, OrderItem, OrderStatus, StatusHistoryEntry, Stop};
use crate::notify::{NotificationKind, UserType, notify_detached};
use crate::state::AppState;
use crate::store::StoreTransaction;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub pickup: Stop,
    pub dropoff: Stop,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_delivery_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl TransitionRequest {
    pub fn to(status: OrderStatus) -> Self {
        Self {
            status,
            note: None,
            lat: None,
            lng: None,
        }
    }

    fn location(&self) -> Result<Option<GeoPoint>, AppError> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => {
                let point = GeoPoint { lat, lng };
                directory::validate_point(&point)?;
                Ok(Some(point))
            }
            (None, None) => Ok(None),
            _ => Err(AppError::BadRequest(
                "lat and lng must be given together".to_string(),
            )),
        }
    }
}

/// Result of one accepted status change, staged in a transaction.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub order: Order,
    pub from: OrderStatus,
    pub entry: StatusHistoryEntry,
    pub released_driver: Option<Uuid>,
}

fn validate_stop(label: &str, stop: &Stop) -> Result<(), AppError> {
    directory::validate_point(&stop.location)?;
    if stop.address.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{label} address cannot be empty")));
    }
    Ok(())
}

pub async fn create_order(state: &AppState, request: CreateOrder) -> Result<Order, AppError> {
    validate_stop("pickup", &request.pickup)?;
    validate_stop("dropoff", &request.dropoff)?;

    if request.items.is_empty() {
        return Err(AppError::BadRequest("order must contain at least one item".to_string()));
    }
    if let Some(item) = request
        .items
        .iter()
        .find(|item| item.name.trim().is_empty() || item.quantity == 0)
    {
        return Err(AppError::BadRequest(format!(
            "invalid item {:?}: name and a positive quantity are required",
            item.name
        )));
    }
    if let (Some(pickup), Some(delivery)) = (request.scheduled_pickup_at, request.scheduled_delivery_at) {
        if delivery < pickup {
            return Err(AppError::BadRequest(
                "scheduled delivery precedes scheduled pickup".to_string(),
            ));
        }
    }

    let now = Utc::now();
    let order = Order {
        id: Uuid::new_v4(),
        customer_id: request.customer_id,
        merchant_id: request.merchant_id,
        status: OrderStatus::PendingPayment,
        pickup: request.pickup,
        dropoff: request.dropoff,
        items: request.items,
        driver_id: None,
        created_at: now,
        updated_at: now,
        scheduled_pickup_at: request.scheduled_pickup_at,
        actual_pickup_at: None,
        scheduled_delivery_at: request.scheduled_delivery_at,
        actual_delivery_at: None,
        cancellation_reason: None,
    };
    let initial = StatusHistoryEntry::new(order.id, order.status, None, None, now);

    state.store.insert_order(order.clone(), initial).await?;
    info!(order_id = %order.id, merchant_id = %order.merchant_id, "order created");

    state.broadcaster.publish(
        Topic::Merchant(order.merchant_id),
        &DispatchEvent::OrderCreated {
            order_id: order.id,
            customer_id: order.customer_id,
            merchant_id: order.merchant_id,
            status: order.status,
            created_at: order.created_at,
        },
    );
    notify_detached(
        &state.notifier,
        order.merchant_id,
        UserType::Merchant,
        NotificationKind::OrderCreated,
        json!({ "order_id": order.id }),
    );

    Ok(order)
}

pub async fn get_order(state: &AppState, id: Uuid) -> Result<Order, AppError> {
    state
        .store
        .get_order(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))
}

pub async fn order_history(state: &AppState, id: Uuid) -> Result<Vec<StatusHistoryEntry>, AppError> {
    get_order(state, id).await?;
    Ok(state.store.order_history(id).await?)
}

pub async fn transition_status(
    state: &AppState,
    order_id: Uuid,
    request: TransitionRequest,
) -> Result<Order, AppError> {
    let location = request.location()?;

    let mut tx = state.store.begin().await?;
    let order = tx
        .order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    if request.status == OrderStatus::DriverAssigned && order.status.can_transition_to(request.status) {
        return Err(AppError::InvalidOperation(
            "drivers are attached through assignment, not a bare status change".to_string(),
        ));
    }

    let applied = apply_transition(tx.as_mut(), order, request.status, request.note, location).await?;
    tx.commit().await?;

    announce_transition(state, &applied).await;
    Ok(applied.order)
}

pub async fn cancel_order(
    state: &AppState,
    order_id: Uuid,
    reason: Option<String>,
) -> Result<Order, AppError> {
    let mut tx = state.store.begin().await?;
    let mut order = tx
        .order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    if !order.status.is_cancellable() {
        return Err(AppError::InvalidOperation(format!(
            "order {order_id} cannot be cancelled in status {}",
            order.status
        )));
    }

    order.cancellation_reason = reason.clone();
    let applied = apply_transition(tx.as_mut(), order, OrderStatus::Cancelled, reason, None).await?;
    tx.commit().await?;

    announce_transition(state, &applied).await;
    Ok(applied.order)
}

/// Validates and stages one status change: the order update, exactly one
/// ledger entry, status-triggered timestamps, and the driver release when
/// the order resolves. Nothing is written unless the caller commits.
pub async fn apply_transition(
    tx: &mut dyn StoreTransaction,
    mut order: Order,
    to: OrderStatus,
    note: Option<String>,
    location: Option<GeoPoint>,
) -> Result<AppliedTransition, AppError> {
    let from = order.status;
    if !from.can_transition_to(to) {
        return Err(AppError::InvalidTransition { from, to });
    }

    let now = Utc::now();
    order.status = to;
    order.updated_at = now;
    match to {
        OrderStatus::PickedUp => order.actual_pickup_at = Some(now),
        OrderStatus::Delivered => order.actual_delivery_at = Some(now),
        _ => {}
    }

    let entry = StatusHistoryEntry::new(order.id, to, note, location, now);
    tx.put_order(order.clone()).await?;
    tx.append_history(entry.clone()).await?;

    let released_driver = match order.driver_id {
        Some(driver_id) if to.is_resolved() => {
            if directory::mark_available(tx, driver_id).await? {
                Some(driver_id)
            } else {
                None
            }
        }
        _ => None,
    };

    Ok(AppliedTransition {
        order,
        from,
        entry,
        released_driver,
    })
}

/// Post-commit side effects of a status change. Never fails: the change
/// is already durable.
pub async fn announce_transition(state: &AppState, applied: &AppliedTransition) {
    let order = &applied.order;

    state
        .metrics
        .status_transitions_total
        .with_label_values(&[order.status.as_str()])
        .inc();
    info!(
        order_id = %order.id,
        from = %applied.from,
        to = %order.status,
        "order status changed"
    );
    if let Some(driver_id) = applied.released_driver {
        info!(order_id = %order.id, driver_id = %driver_id, "driver released");
    }

    let mut topics = vec![
        Topic::Order(order.id),
        Topic::Customer(order.customer_id),
        Topic::Merchant(order.merchant_id),
    ];
    if let Some(driver_id) = order.driver_id {
        topics.push(Topic::Driver(driver_id));
    }

    let location = match (applied.entry.lat, applied.entry.lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    };
    state.broadcaster.publish_all(
        &topics,
        &DispatchEvent::StatusChanged {
            order_id: order.id,
            from: applied.from,
            to: order.status,
            note: applied.entry.note.clone(),
            location,
            changed_at: applied.entry.recorded_at,
        },
    );

    notify_detached(
        &state.notifier,
        order.customer_id,
        UserType::Customer,
        NotificationKind::StatusChanged,
        json!({ "order_id": order.id, "from": applied.from, "to": order.status }),
    );

    if order.status == OrderStatus::PaymentConfirmed {
        if let Err(err) = coordinator::offer_order(state, order).await {
            warn!(order_id = %order.id, error = %err, "failed to offer order to drivers");
        }
    }
}
