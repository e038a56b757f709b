//! Storage seam for orders, drivers and the status ledger.
//!
//! The engine never touches tables directly. Point lookups and filtered
//! queries go through [`Store`]; anything that mutates contended state
//! (order status, driver availability) runs inside a [`StoreTransaction`]
//! so the whole read-validate-write sequence commits or vanishes together.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::geo::BoundingBox;
use crate::models::driver::{Driver, DriverAvailability, VehicleType};
use crate::models::order::{Order, StatusHistoryEntry};

pub use memory::InMemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Coarse driver filter evaluated by the backend. Exact distance checks
/// happen in the caller.
#[derive(Debug, Clone, Default)]
pub struct DriverQuery {
    /// Empty means any availability.
    pub availability: Vec<DriverAvailability>,
    pub verified_only: bool,
    pub located_only: bool,
    pub vehicle_type: Option<VehicleType>,
    pub within: Option<BoundingBox>,
}

impl DriverQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_availability(mut self, availability: &[DriverAvailability]) -> Self {
        self.availability = availability.to_vec();
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified_only = true;
        self
    }

    pub fn located(mut self) -> Self {
        self.located_only = true;
        self
    }

    pub fn with_vehicle_type(mut self, vehicle_type: Option<VehicleType>) -> Self {
        self.vehicle_type = vehicle_type;
        self
    }

    pub fn within(mut self, bbox: BoundingBox) -> Self {
        self.within = Some(bbox);
        self
    }

    pub fn matches(&self, driver: &Driver) -> bool {
        if !self.availability.is_empty() && !self.availability.contains(&driver.availability) {
            return false;
        }
        if self.verified_only && !driver.verified {
            return false;
        }
        if let Some(vehicle_type) = self.vehicle_type {
            if driver.vehicle_type != vehicle_type {
                return false;
            }
        }

        match (&driver.location, &self.within) {
            (None, _) => !self.located_only && self.within.is_none(),
            (Some(location), Some(bbox)) => bbox.contains(location),
            (Some(_), None) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub orders: usize,
    pub drivers: usize,
    pub history_entries: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new order together with its first ledger entry.
    async fn insert_order(
        &self,
        order: Order,
        initial: StatusHistoryEntry,
    ) -> Result<(), StoreError>;

    async fn insert_driver(&self, driver: Driver) -> Result<(), StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn get_driver(&self, id: Uuid) -> Result<Option<Driver>, StoreError>;

    /// Ledger entries for an order, oldest first.
    async fn order_history(&self, order_id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError>;

    async fn list_drivers(&self, query: &DriverQuery) -> Result<Vec<Driver>, StoreError>;

    /// Orders held by a driver that have not reached a resolved status.
    async fn active_orders_for_driver(&self, driver_id: Uuid) -> Result<Vec<Order>, StoreError>;

    async fn count_active_orders(&self, driver_id: Uuid) -> Result<usize, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    /// Opens a transaction. Concurrent transactions are serialised by the
    /// backend; reads inside one see its own staged writes.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn driver(&mut self, id: Uuid) -> Result<Option<Driver>, StoreError>;

    async fn count_active_orders(&mut self, driver_id: Uuid) -> Result<usize, StoreError>;

    async fn put_order(&mut self, order: Order) -> Result<(), StoreError>;

    async fn put_driver(&mut self, driver: Driver) -> Result<(), StoreError>;

    async fn append_history(&mut self, entry: StatusHistoryEntry) -> Result<(), StoreError>;

    /// Applies every staged write. Dropping the transaction instead
    /// discards them.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
