use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use turnstile_shared::InventoryCounter;

use crate::clock::Clock;
use crate::repository::{CounterStore, LedgerCategory, LedgerRepository};
use crate::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InventorySource {
    Cache,
    Db,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryInventory {
    pub category_id: String,
    pub total: i64,
    pub sold: i64,
    pub pending: i64,
    pub available: i64,
    pub source: InventorySource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInventory {
    pub event_id: String,
    pub inventory: Vec<CategoryInventory>,
}

/// Per-category availability for an event. The ledger decides which
/// categories exist; live numbers come from the fast store, with a derived
/// ledger figure when the counter is missing.
pub struct InventoryService {
    counters: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerRepository>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(counters: Arc<dyn CounterStore>, ledger: Arc<dyn LedgerRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { counters, ledger, clock }
    }

    pub async fn get(&self, event_id: &str) -> CoreResult<EventInventory> {
        let categories = self.ledger.categories(event_id).await?;
        let mut inventory = Vec::with_capacity(categories.len());

        for category in categories {
            let cached = match self.counters.counter(event_id, &category.category_id).await {
                Ok(counter) => counter,
                Err(e) => {
                    warn!("Counter read failed for {}:{}: {}", event_id, category.category_id, e);
                    None
                }
            };

            match cached {
                Some(counter) => inventory.push(CategoryInventory {
                    category_id: category.category_id,
                    total: counter.total,
                    sold: counter.sold,
                    pending: counter.pending,
                    available: counter.available,
                    source: InventorySource::Cache,
                }),
                None => inventory.push(self.from_ledger(event_id, category).await?),
            }
        }

        Ok(EventInventory {
            event_id: event_id.to_string(),
            inventory,
        })
    }

    async fn from_ledger(&self, event_id: &str, category: LedgerCategory) -> CoreResult<CategoryInventory> {
        let reserved = self
            .ledger
            .active_reservations(event_id, &category.category_id, self.clock.now())
            .await?;
        let sold = category.quantity_total - category.available_quantity;
        let available = (category.available_quantity - reserved).max(0);

        self.spawn_read_repair(InventoryCounter {
            event_id: event_id.to_string(),
            category_id: category.category_id.clone(),
            total: category.quantity_total,
            sold,
            pending: 0,
            available,
            reserved,
            version: 1,
        });

        Ok(CategoryInventory {
            category_id: category.category_id,
            total: category.quantity_total,
            sold,
            pending: reserved,
            available,
            source: InventorySource::Db,
        })
    }

    /// Fills the missing counter in the background. Never overwrites a
    /// counter that appeared in the meantime.
    fn spawn_read_repair(&self, counter: InventoryCounter) {
        let counters = self.counters.clone();
        tokio::spawn(async move {
            match counters.populate_if_absent(&counter).await {
                Ok(true) => debug!("Read-repaired counter {}:{}", counter.event_id, counter.category_id),
                Ok(false) => {}
                Err(e) => warn!(
                    "Read-repair failed for {}:{}: {}",
                    counter.event_id, counter.category_id, e
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{LedgerReservation, MemoryLedger, MemoryStore};
    use crate::CoreError;
    use chrono::Duration;

    async fn wait_for_counter(store: &MemoryStore, category_id: &str) -> InventoryCounter {
        for _ in 0..50 {
            if let Some(counter) = store.counter("evt-001", category_id).await.unwrap() {
                return counter;
            }
            tokio::task::yield_now().await;
        }
        panic!("read-repair never ran");
    }

    #[tokio::test]
    async fn test_cache_hit_and_ledger_fallback_with_read_repair() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ledger = Arc::new(MemoryLedger::new());
        ledger.upsert_category("evt-001", "cat-001-1", 10, 10);
        ledger.upsert_category("evt-001", "cat-001-2", 50, 40);
        store
            .seed(&InventoryCounter::seeded("evt-001", "cat-001-1", 10, 0))
            .await
            .unwrap();
        ledger.add_reservation(LedgerReservation {
            hold_token: "tok-a".into(),
            event_id: "evt-001".into(),
            category_id: "cat-001-2".into(),
            quantity: 5,
            status: "active".into(),
            expires_at: clock.now() + Duration::minutes(5),
        });
        ledger.add_reservation(LedgerReservation {
            hold_token: "tok-b".into(),
            event_id: "evt-001".into(),
            category_id: "cat-001-2".into(),
            quantity: 7,
            status: "active".into(),
            expires_at: clock.now() - Duration::minutes(5),
        });

        let service = InventoryService::new(store.clone(), ledger, clock);
        let result = service.get("evt-001").await.unwrap();

        assert_eq!(result.inventory.len(), 2);
        assert_eq!(result.inventory[0].source, InventorySource::Cache);
        assert_eq!(result.inventory[0].available, 10);

        let fallback = &result.inventory[1];
        assert_eq!(fallback.source, InventorySource::Db);
        assert_eq!(
            (fallback.total, fallback.sold, fallback.pending, fallback.available),
            (50, 10, 5, 35)
        );

        let repaired = wait_for_counter(&store, "cat-001-2").await;
        assert_eq!(
            (repaired.total, repaired.sold, repaired.pending, repaired.reserved, repaired.available),
            (50, 10, 0, 5, 35)
        );
    }

    #[tokio::test]
    async fn test_unknown_event_is_empty_and_ledger_errors_surface() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ledger = Arc::new(MemoryLedger::new());
        let service = InventoryService::new(store, ledger.clone(), clock);

        assert!(service.get("evt-404").await.unwrap().inventory.is_empty());

        ledger.set_unavailable(true);
        assert!(matches!(service.get("evt-001").await, Err(CoreError::LedgerError(_))));
    }
}
