use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::holds::HoldManager;
use crate::repository::{LedgerRepository, ReleaseOutcome};
use crate::{CoreError, CoreResult, NotFoundKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderExpirySettings {
    pub interval_seconds: u64,
    pub batch_size: usize,
}

impl Default for OrderExpirySettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub orders_expired: usize,
    pub holds_released: usize,
}

/// Cancels unpaid orders past their deadline and hands their holds back to the
/// pool. The ledger never decremented anything for an unpaid order, so only
/// the fast store needs restoring.
pub struct OrderExpiryReaper {
    ledger: Arc<dyn LedgerRepository>,
    holds: Arc<HoldManager>,
    clock: Arc<dyn Clock>,
    settings: OrderExpirySettings,
}

impl OrderExpiryReaper {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        holds: Arc<HoldManager>,
        clock: Arc<dyn Clock>,
        settings: OrderExpirySettings,
    ) -> Self {
        Self {
            ledger,
            holds,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &OrderExpirySettings {
        &self.settings
    }

    pub async fn reap_once(&self) -> CoreResult<ReapReport> {
        let expired = self
            .ledger
            .expire_pending_orders(self.clock.now(), self.settings.batch_size)
            .await?;
        if expired.is_empty() {
            debug!("No expired orders");
            return Ok(ReapReport::default());
        }

        let mut report = ReapReport {
            orders_expired: expired.len(),
            holds_released: 0,
        };
        for order in &expired {
            let Some(token) = order.hold_token.as_deref() else {
                continue;
            };
            match self.holds.release(token).await {
                Ok(ReleaseOutcome::Released) => report.holds_released += 1,
                Ok(ReleaseOutcome::AlreadyTerminal(_)) | Err(CoreError::NotFound(NotFoundKind::Hold)) => {}
                Err(e) => warn!("Could not release hold {} for expired order {}: {}", token, order.order_id, e),
            }
        }

        info!(
            "Expired {} orders, released {} holds",
            report.orders_expired, report.holds_released
        );
        Ok(report)
    }
}
