use std::sync::Arc;
use tracing::{info, warn};
use turnstile_shared::CapacitySyncMessage;

use crate::repository::CounterStore;
use crate::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { available: i64 },
    /// The message did not name an event and category.
    Skipped,
}

/// Applies authoritative total/sold figures from the ledger. The live
/// `pending` in the fast store always wins over the ledger's `reserved`.
pub struct ReconciliationListener {
    counters: Arc<dyn CounterStore>,
}

impl ReconciliationListener {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    pub async fn handle(&self, msg: &CapacitySyncMessage) -> CoreResult<SyncOutcome> {
        if !msg.is_addressable() {
            warn!("Skipping capacity sync without event/category");
            return Ok(SyncOutcome::Skipped);
        }

        let available = self
            .counters
            .sync(
                &msg.event_id,
                &msg.category_id,
                msg.quantity_total,
                msg.quantity_sold,
                msg.quantity_reserved,
            )
            .await?;

        info!(
            "Capacity synced for {}:{} (total {}, sold {}, available {})",
            msg.event_id, msg.category_id, msg.quantity_total, msg.quantity_sold, available
        );
        Ok(SyncOutcome::Synced { available })
    }
}
