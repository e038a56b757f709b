use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::Order;

/// Per-attempt ranking of one candidate; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchCandidateScore {
    pub driver_id: Uuid,
    pub distance_km: f64,
    pub active_order_count: usize,
    pub rating: f64,
    pub score: f64,
    pub eta_minutes: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    Manual,
    Auto,
}

impl AssignmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentMode::Manual => "manual",
            AssignmentMode::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAssignment {
    pub order: Order,
    pub assigned_driver: DispatchCandidateScore,
    /// Next-ranked candidates at the time of assignment. Not reserved.
    pub alternates: Vec<DispatchCandidateScore>,
    pub assigned_at: DateTime<Utc>,
}
