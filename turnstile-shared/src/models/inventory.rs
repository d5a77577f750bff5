use serde::{Deserialize, Serialize};

/// Fast-path counter for one (event, category) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryCounter {
    pub event_id: String,
    pub category_id: String,
    pub total: i64,
    pub sold: i64,
    pub pending: i64,
    pub available: i64,
    /// Reservations the ledger reports on its side. Informational only.
    #[serde(default)]
    pub reserved: i64,
    #[serde(default)]
    pub version: i64,
}

impl InventoryCounter {
    /// A counter with nothing sold or pending.
    pub fn seeded(event_id: &str, category_id: &str, total: i64, sold: i64) -> Self {
        Self {
            event_id: event_id.to_string(),
            category_id: category_id.to_string(),
            total,
            sold,
            pending: 0,
            available: (total - sold).max(0),
            reserved: 0,
            version: 1,
        }
    }

    pub fn recompute_available(&mut self) {
        self.available = (self.total - self.sold - self.pending).max(0);
    }
}

/// A category/quantity pair as submitted by a client, before it is tied to a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub category_id: String,
    pub quantity: i64,
}
