use std::sync::Arc;
use tracing::{error, info, warn};
use turnstile_shared::{HoldStatus, OrderPaidMessage};

use crate::holds::HoldManager;
use crate::repository::{LedgerConfirmation, LedgerRepository};
use crate::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Ledger confirmed and the hold converted to sold.
    Finalized { ledger_rows: usize },
    /// Nothing left to do; a redelivery or an already-expired hold.
    AlreadyFinalized,
    /// The hold has not been claimed yet, so it cannot be sold.
    NotClaimed,
    /// The order expired and was cancelled first; its hold belongs to the
    /// expiry pass.
    OrderCancelled,
    /// The message carried no hold token.
    Skipped,
}

/// Turns a paid order into sold inventory: ledger first, fast store second.
///
/// Redelivery of the same message is a no-op. A ledger failure leaves the hold
/// claimed and surfaces the error so the broker delivers again.
pub struct FinalizationListener {
    holds: Arc<HoldManager>,
    ledger: Arc<dyn LedgerRepository>,
}

impl FinalizationListener {
    pub fn new(holds: Arc<HoldManager>, ledger: Arc<dyn LedgerRepository>) -> Self {
        Self { holds, ledger }
    }

    pub async fn handle(&self, msg: &OrderPaidMessage) -> CoreResult<FinalizeOutcome> {
        let token = msg.hold_token.trim();
        if token.is_empty() {
            warn!("Skipping order-paid message {} without hold token", msg.order_id);
            return Ok(FinalizeOutcome::Skipped);
        }

        // Read first: finalizing deletes the record.
        let Some(hold) = self.holds.get(token).await? else {
            warn!("Hold {} not found or already finalized (order {})", token, msg.order_id);
            return Ok(FinalizeOutcome::AlreadyFinalized);
        };
        if hold.status != HoldStatus::Claimed {
            warn!(
                "Hold {} for order {} is {}, not claimed; skipping finalize",
                token, msg.order_id, hold.status
            );
            return Ok(FinalizeOutcome::NotClaimed);
        }

        let ledger_rows = match self.ledger.confirm_hold(token, &hold.entries).await? {
            LedgerConfirmation::Confirmed(rows) => rows,
            LedgerConfirmation::OrderCancelled => {
                warn!(
                    "Order {} was cancelled before payment landed; hold {} left to the expiry pass",
                    msg.order_id, token
                );
                return Ok(FinalizeOutcome::OrderCancelled);
            }
        };

        if self.holds.mark_committed(token).await? {
            info!(
                "Hold {} finalized for order {} ({} ledger rows)",
                token, msg.order_id, ledger_rows
            );
            Ok(FinalizeOutcome::Finalized { ledger_rows })
        } else if ledger_rows > 0 {
            // Released between the read and the commit. The next capacity sync
            // carries the ledger's sold figure back into the counter.
            error!(
                "Hold {} was released while order {} was being confirmed; counter stale until next sync",
                token, msg.order_id
            );
            Ok(FinalizeOutcome::AlreadyFinalized)
        } else {
            warn!("Hold {} vanished before commit (order {})", token, msg.order_id);
            Ok(FinalizeOutcome::AlreadyFinalized)
        }
    }
}
