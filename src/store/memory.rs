use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::models::driver::Driver;
use crate::models::order::{Order, StatusHistoryEntry};
use crate::store::{DriverQuery, Store, StoreCounts, StoreError, StoreTransaction};

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    drivers: HashMap<Uuid, Driver>,
    history: HashMap<Uuid, Vec<StatusHistoryEntry>>,
}

fn holds_driver(order: &Order, driver_id: Uuid) -> bool {
    order.driver_id == Some(driver_id) && !order.status.is_resolved()
}

/// Process-local store. Each instance owns its own tables, so tests can
/// run side by side without sharing state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_order(
        &self,
        order: Order,
        initial: StatusHistoryEntry,
    ) -> Result<(), StoreError> {
        if initial.order_id != order.id {
            return Err(StoreError::Integrity(format!(
                "history entry for {} attached to order {}",
                initial.order_id, order.id
            )));
        }

        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(format!("order {}", order.id)));
        }

        tables.history.entry(order.id).or_default().push(initial);
        tables.orders.insert(order.id, order);
        Ok(())
    }

    async fn insert_driver(&self, driver: Driver) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.drivers.contains_key(&driver.id) {
            return Err(StoreError::Duplicate(format!("driver {}", driver.id)));
        }

        tables.drivers.insert(driver.id, driver);
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn get_driver(&self, id: Uuid) -> Result<Option<Driver>, StoreError> {
        Ok(self.tables.read().await.drivers.get(&id).cloned())
    }

    async fn order_history(&self, order_id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .history
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_drivers(&self, query: &DriverQuery) -> Result<Vec<Driver>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .drivers
            .values()
            .filter(|driver| query.matches(driver))
            .cloned()
            .collect())
    }

    async fn active_orders_for_driver(&self, driver_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .filter(|order| holds_driver(order, driver_id))
            .cloned()
            .collect())
    }

    async fn count_active_orders(&self, driver_id: Uuid) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .filter(|order| holds_driver(order, driver_id))
            .count())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let tables = self.tables.read().await;
        Ok(StoreCounts {
            orders: tables.orders.len(),
            drivers: tables.drivers.len(),
            history_entries: tables.history.values().map(Vec::len).sum(),
        })
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tables.clone().write_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables: guard,
            orders: HashMap::new(),
            drivers: HashMap::new(),
            history: Vec::new(),
        }))
    }
}

/// Holds the table write lock for its whole lifetime. Writes are staged
/// and only reach the tables in `commit`.
pub struct MemoryTransaction {
    tables: OwnedRwLockWriteGuard<Tables>,
    orders: HashMap<Uuid, Order>,
    drivers: HashMap<Uuid, Driver>,
    history: Vec<StatusHistoryEntry>,
}

impl MemoryTransaction {
    fn current_order(&self, id: &Uuid) -> Option<&Order> {
        self.orders.get(id).or_else(|| self.tables.orders.get(id))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn order(&mut self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.current_order(&id).cloned())
    }

    async fn driver(&mut self, id: Uuid) -> Result<Option<Driver>, StoreError> {
        Ok(self
            .drivers
            .get(&id)
            .or_else(|| self.tables.drivers.get(&id))
            .cloned())
    }

    async fn count_active_orders(&mut self, driver_id: Uuid) -> Result<usize, StoreError> {
        let committed = self
            .tables
            .orders
            .iter()
            .filter(|(id, _)| !self.orders.contains_key(*id))
            .filter(|(_, order)| holds_driver(order, driver_id))
            .count();
        let staged = self
            .orders
            .values()
            .filter(|order| holds_driver(order, driver_id))
            .count();

        Ok(committed + staged)
    }

    async fn put_order(&mut self, order: Order) -> Result<(), StoreError> {
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn put_driver(&mut self, driver: Driver) -> Result<(), StoreError> {
        self.drivers.insert(driver.id, driver);
        Ok(())
    }

    async fn append_history(&mut self, entry: StatusHistoryEntry) -> Result<(), StoreError> {
        self.history.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut tables,
            orders,
            drivers,
            history,
        } = *self;

        // Validate everything before touching the tables so a rejected
        // commit leaves no trace.
        for entry in &history {
            if !orders.contains_key(&entry.order_id) && !tables.orders.contains_key(&entry.order_id) {
                return Err(StoreError::Integrity(format!(
                    "history entry for unknown order {}",
                    entry.order_id
                )));
            }
        }

        tables.orders.extend(orders);
        tables.drivers.extend(drivers);
        for entry in history {
            tables.history.entry(entry.order_id).or_default().push(entry);
        }

        Ok(())
    }
}
