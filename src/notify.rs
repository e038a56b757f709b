use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Customer,
    Driver,
    Merchant,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Customer => "customer",
            UserType::Driver => "driver",
            UserType::Merchant => "merchant",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderCreated,
    StatusChanged,
    DriverAssigned,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderCreated => "order_created",
            NotificationKind::StatusChanged => "status_changed",
            NotificationKind::DriverAssigned => "driver_assigned",
        }
    }
}

/// Outbound channel to email/SMS/push delivery, owned by another service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        user_type: UserType,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotifyError>;
}

/// Records notifications in the log instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        user_type: UserType,
        kind: NotificationKind,
        payload: Value,
    ) -> Result<(), NotifyError> {
        info!(
            user_id = %user_id,
            user_type = user_type.as_str(),
            kind = kind.as_str(),
            payload = %payload,
            "notification dispatched"
        );
        Ok(())
    }
}

/// Hands the notification to a background task. Failures are logged and
/// never reach the caller.
pub fn notify_detached(
    notifier: &Arc<dyn Notifier>,
    user_id: Uuid,
    user_type: UserType,
    kind: NotificationKind,
    payload: Value,
) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        if let Err(err) = notifier.notify(user_id, user_type, kind, payload).await {
            warn!(
                user_id = %user_id,
                user_type = user_type.as_str(),
                kind = kind.as_str(),
                error = %err,
                "notification failed"
            );
        }
    });
}
