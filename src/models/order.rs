use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPayment,
    PaymentConfirmed,
    AwaitingCustomerDropoff,
    DriverAssigned,
    PickedUp,
    InTransitToMerchant,
    ReceivedByMerchant,
    InProcess,
    ReadyForDelivery,
    ReadyForCustomerPickup,
    OutForDelivery,
    Delivered,
    PickedUpByCustomer,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 15] = [
        OrderStatus::PendingPayment,
        OrderStatus::PaymentConfirmed,
        OrderStatus::AwaitingCustomerDropoff,
        OrderStatus::DriverAssigned,
        OrderStatus::PickedUp,
        OrderStatus::InTransitToMerchant,
        OrderStatus::ReceivedByMerchant,
        OrderStatus::InProcess,
        OrderStatus::ReadyForDelivery,
        OrderStatus::ReadyForCustomerPickup,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
        OrderStatus::PickedUpByCustomer,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    /// Statuses reachable in one step. Every edge moves strictly forward,
    /// so the table has no cycles.
    pub fn allowed_next(self) -> &'static [OrderStatus] {
        use OrderStatus::*;

        match self {
            PendingPayment => &[PaymentConfirmed, Cancelled],
            PaymentConfirmed => &[DriverAssigned, AwaitingCustomerDropoff, Cancelled, Refunded],
            AwaitingCustomerDropoff => &[ReceivedByMerchant, Cancelled, Refunded],
            DriverAssigned => &[PickedUp, Cancelled, Refunded],
            PickedUp => &[InTransitToMerchant],
            InTransitToMerchant => &[ReceivedByMerchant],
            ReceivedByMerchant => &[InProcess],
            InProcess => &[ReadyForDelivery, ReadyForCustomerPickup],
            ReadyForDelivery => &[OutForDelivery],
            ReadyForCustomerPickup => &[PickedUpByCustomer],
            OutForDelivery => &[Delivered],
            Delivered => &[Refunded],
            PickedUpByCustomer => &[Refunded],
            Cancelled => &[],
            Refunded => &[],
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            OrderStatus::PendingPayment
                | OrderStatus::PaymentConfirmed
                | OrderStatus::DriverAssigned
                | OrderStatus::AwaitingCustomerDropoff
        )
    }

    /// Whether a driver may be attached to an order in this status.
    pub fn is_assignable(self) -> bool {
        self == OrderStatus::PaymentConfirmed
    }

    /// Resolved orders no longer hold their driver.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered
                | OrderStatus::PickedUpByCustomer
                | OrderStatus::Cancelled
                | OrderStatus::Refunded
        )
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::PaymentConfirmed => "PAYMENT_CONFIRMED",
            OrderStatus::AwaitingCustomerDropoff => "AWAITING_CUSTOMER_DROPOFF",
            OrderStatus::DriverAssigned => "DRIVER_ASSIGNED",
            OrderStatus::PickedUp => "PICKED_UP",
            OrderStatus::InTransitToMerchant => "IN_TRANSIT_TO_MERCHANT",
            OrderStatus::ReceivedByMerchant => "RECEIVED_BY_MERCHANT",
            OrderStatus::InProcess => "IN_PROCESS",
            OrderStatus::ReadyForDelivery => "READY_FOR_DELIVERY",
            OrderStatus::ReadyForCustomerPickup => "READY_FOR_CUSTOMER_PICKUP",
            OrderStatus::OutForDelivery => "OUT_FOR_DELIVERY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::PickedUpByCustomer => "PICKED_UP_BY_CUSTOMER",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stop {
    pub location: GeoPoint,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub status: OrderStatus,
    pub pickup: Stop,
    pub dropoff: Stop,
    pub items: Vec<OrderItem>,
    pub driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_pickup_at: Option<DateTime<Utc>>,
    pub actual_pickup_at: Option<DateTime<Utc>>,
    pub scheduled_delivery_at: Option<DateTime<Utc>>,
    pub actual_delivery_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

/// One row of the append-only status ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub note: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn new(
        order_id: Uuid,
        status: OrderStatus,
        note: Option<String>,
        location: Option<GeoPoint>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            status,
            note,
            lat: location.map(|point| point.lat),
            lng: location.map(|point| point.lng),
            recorded_at,
        }
    }
}
