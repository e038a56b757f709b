//! Real-time lifecycle and location events.
//!
//! Events are published to topic-scoped channels after the mutation that
//! caused them has committed. Delivery is best-effort: subscribers that
//! are not connected, or whose buffer is full, miss the event and must
//! re-read current state.

pub mod broadcaster;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;
use crate::models::order::OrderStatus;

pub use broadcaster::{ConnectionId, EventBroadcaster, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Topic {
    Order(Uuid),
    Driver(Uuid),
    Customer(Uuid),
    Merchant(Uuid),
}

impl Topic {
    pub fn is_order(&self) -> bool {
        matches!(self, Topic::Order(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Order(id) => write!(f, "order:{id}"),
            Topic::Driver(id) => write!(f, "driver:{id}"),
            Topic::Customer(id) => write!(f, "customer:{id}"),
            Topic::Merchant(id) => write!(f, "merchant:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| format!("channel {raw} is not <kind>:<id>"))?;
        let id = Uuid::parse_str(id).map_err(|err| format!("invalid channel id {id}: {err}"))?;

        match kind {
            "order" => Ok(Topic::Order(id)),
            "driver" => Ok(Topic::Driver(id)),
            "customer" => Ok(Topic::Customer(id)),
            "merchant" => Ok(Topic::Merchant(id)),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

impl TryFrom<String> for Topic {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

/// Every event kind the coordinator publishes, with its fixed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    OrderCreated {
        order_id: Uuid,
        customer_id: Uuid,
        merchant_id: Uuid,
        status: OrderStatus,
        created_at: DateTime<Utc>,
    },
    StatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        note: Option<String>,
        location: Option<GeoPoint>,
        changed_at: DateTime<Utc>,
    },
    DriverAssigned {
        order_id: Uuid,
        driver_id: Uuid,
        distance_km: Option<f64>,
        eta_minutes: Option<u32>,
        assigned_at: DateTime<Utc>,
    },
    LocationUpdate {
        driver_id: Uuid,
        location: GeoPoint,
        recorded_at: DateTime<Utc>,
    },
    OrderAvailable {
        order_id: Uuid,
        pickup: GeoPoint,
        distance_km: f64,
        eta_minutes: u32,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::OrderCreated { .. } => "order_created",
            DispatchEvent::StatusChanged { .. } => "status_changed",
            DispatchEvent::DriverAssigned { .. } => "driver_assigned",
            DispatchEvent::LocationUpdate { .. } => "location_update",
            DispatchEvent::OrderAvailable { .. } => "order_available",
        }
    }
}

/// What a subscriber receives: the event plus the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Topic,
    #[serde(flatten)]
    pub event: DispatchEvent,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{DispatchEvent, Envelope, Topic};
    use crate::models::order::OrderStatus;

    #[test]
    fn topic_round_trips_through_its_channel_name() {
        let id = Uuid::from_u128(7);
        let topic = Topic::Driver(id);

        assert_eq!(topic.to_string(), format!("driver:{id}"));
        assert_eq!(topic.to_string().parse::<Topic>().unwrap(), topic);
    }

    #[test]
    fn malformed_channels_are_rejected() {
        assert!("order".parse::<Topic>().is_err());
        assert!("fleet:00000000-0000-0000-0000-000000000001".parse::<Topic>().is_err());
        assert!("order:not-a-uuid".parse::<Topic>().is_err());
    }

    #[test]
    fn envelope_serializes_flat_with_type_tag() {
        let order_id = Uuid::from_u128(1);
        let envelope = Envelope {
            channel: Topic::Order(order_id),
            event: DispatchEvent::StatusChanged {
                order_id,
                from: OrderStatus::PaymentConfirmed,
                to: OrderStatus::DriverAssigned,
                note: None,
                location: None,
                changed_at: Utc::now(),
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["channel"], format!("order:{order_id}"));
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "DRIVER_ASSIGNED");
    }
}
