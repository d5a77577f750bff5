use serde::{Deserialize, Serialize};

/// Authoritative capacity figures for one category, published by the ledger database.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CapacitySyncMessage {
    pub event_id: String,
    pub category_id: String,
    pub quantity_total: i64,
    pub quantity_sold: i64,
    pub quantity_reserved: i64,
    pub timestamp: Option<String>,
}

impl CapacitySyncMessage {
    pub fn is_addressable(&self) -> bool {
        !self.event_id.trim().is_empty() && !self.category_id.trim().is_empty()
    }
}

/// Published by the payment flow once an order has been paid.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderPaidMessage {
    pub order_id: String,
    pub event_id: String,
    pub user_id: String,
    pub hold_token: String,
    pub payment_reference: String,
}
