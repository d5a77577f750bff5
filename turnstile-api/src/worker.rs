use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use turnstile_core::finalize::{FinalizationListener, FinalizeOutcome};
use turnstile_core::reaper::OrderExpiryReaper;
use turnstile_core::reconcile::{ReconciliationListener, SyncOutcome};
use turnstile_core::sweeper::CleanupSweeper;
use turnstile_core::CoreError;
use turnstile_shared::{CapacitySyncMessage, OrderPaidMessage};
use turnstile_store::{HandlerError, MessageHandler};

use crate::metrics::Metrics;

pub async fn start_cleanup_worker(sweeper: CleanupSweeper, metrics: Arc<Metrics>) {
    let every = sweeper.settings().interval_seconds.max(1);
    let mut ticker = interval(Duration::from_secs(every));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Cleanup worker started, sweeping every {}s", every);

    loop {
        ticker.tick().await;
        match sweeper.sweep_once().await {
            Ok(cleaned) => metrics.holds_swept.inc_by(cleaned as u64),
            Err(e) => error!("Hold sweep failed: {}", e),
        }
    }
}

pub async fn start_order_expiry_worker(reaper: OrderExpiryReaper, metrics: Arc<Metrics>) {
    let every = reaper.settings().interval_seconds.max(1);
    let mut ticker = interval(Duration::from_secs(every));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Order expiry worker started, checking every {}s", every);

    loop {
        ticker.tick().await;
        match reaper.reap_once().await {
            Ok(report) => metrics.orders_expired.inc_by(report.orders_expired as u64),
            Err(e) => error!("Order expiry pass failed: {}", e),
        }
    }
}

/// Routes broker messages to the listener that owns the topic.
pub struct BrokerDispatcher {
    capacity_topic: String,
    order_paid_topic: String,
    reconciliation: ReconciliationListener,
    finalization: FinalizationListener,
    metrics: Arc<Metrics>,
}

impl BrokerDispatcher {
    pub fn new(
        capacity_topic: impl Into<String>,
        order_paid_topic: impl Into<String>,
        reconciliation: ReconciliationListener,
        finalization: FinalizationListener,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            capacity_topic: capacity_topic.into(),
            order_paid_topic: order_paid_topic.into(),
            reconciliation,
            finalization,
            metrics,
        }
    }

    async fn on_capacity_sync(&self, payload: &str) -> Result<(), HandlerError> {
        let msg: CapacitySyncMessage = parse(payload)?;
        match self.reconciliation.handle(&msg).await.map_err(classify)? {
            SyncOutcome::Synced { .. } => self.metrics.capacity_syncs.inc(),
            SyncOutcome::Skipped => {}
        }
        Ok(())
    }

    async fn on_order_paid(&self, payload: &str) -> Result<(), HandlerError> {
        let msg: OrderPaidMessage = parse(payload)?;
        match self.finalization.handle(&msg).await.map_err(classify)? {
            FinalizeOutcome::Finalized { .. } => self.metrics.holds_finalized.inc(),
            outcome => debug!("Order {} needed no finalization: {:?}", msg.order_id, outcome),
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for BrokerDispatcher {
    async fn handle(&self, topic: &str, payload: &str) -> Result<(), HandlerError> {
        if topic == self.capacity_topic {
            self.on_capacity_sync(payload).await
        } else if topic == self.order_paid_topic {
            self.on_order_paid(payload).await
        } else {
            warn!("Ignoring message on unexpected topic {}", topic);
            Ok(())
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, HandlerError> {
    serde_json::from_str(payload).map_err(|e| HandlerError::Malformed(e.to_string()))
}

/// Infrastructure failures are retried; anything else will fail the same way
/// on every attempt.
fn classify(err: CoreError) -> HandlerError {
    if err.is_infrastructure() {
        HandlerError::Failed(err.to_string())
    } else {
        HandlerError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::clock::ManualClock;
    use turnstile_core::holds::{HoldManager, HoldRequest, HoldSettings};
    use turnstile_core::memory::{MemoryLedger, MemoryStore};
    use turnstile_core::repository::{CounterStore, HoldStore, LedgerRepository};
    use turnstile_shared::{HoldEntry, InventoryCounter};
    use turnstile_store::{deliver, Delivery, RetryPolicy};

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        holds: Arc<HoldManager>,
        metrics: Arc<Metrics>,
        dispatcher: BrokerDispatcher,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store
            .seed(&InventoryCounter::seeded("evt-001", "cat-001-1", 10, 0))
            .await
            .unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.upsert_category("evt-001", "cat-001-1", 10, 10);
        let holds = Arc::new(HoldManager::new(
            store.clone() as Arc<dyn HoldStore>,
            clock,
            HoldSettings::default(),
        ));
        let metrics = Arc::new(Metrics::new().unwrap());
        let dispatcher = BrokerDispatcher::new(
            "capacity-sync",
            "order-paid",
            ReconciliationListener::new(store.clone() as Arc<dyn CounterStore>),
            FinalizationListener::new(holds.clone(), ledger.clone() as Arc<dyn LedgerRepository>),
            metrics.clone(),
        );
        Fixture {
            store,
            ledger,
            holds,
            metrics,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_order_paid_finalizes_claimed_hold_once() {
        let f = fixture().await;
        let grant = f
            .holds
            .acquire(HoldRequest {
                event_id: "evt-001".into(),
                entries: vec![HoldEntry {
                    event_id: "evt-001".into(),
                    category_id: "cat-001-1".into(),
                    quantity: 2,
                }],
                ..HoldRequest::default()
            })
            .await
            .unwrap();
        f.holds.claim(&grant.hold_token).await.unwrap();

        let payload = format!(
            r#"{{"orderId":"ord-1","eventId":"evt-001","userId":"u-1","holdToken":"{}","paymentReference":"pay-1"}}"#,
            grant.hold_token
        );
        f.dispatcher.handle("order-paid", &payload).await.unwrap();
        f.dispatcher.handle("order-paid", &payload).await.unwrap();

        assert_eq!(f.metrics.holds_finalized.get(), 1);
        let counter = f.store.counter("evt-001", "cat-001-1").await.unwrap().unwrap();
        assert_eq!((counter.available, counter.pending, counter.sold), (8, 0, 2));
        assert_eq!(f.ledger.category("evt-001", "cat-001-1").unwrap().available_quantity, 8);
    }

    #[tokio::test]
    async fn test_capacity_sync_is_applied_and_counted() {
        let f = fixture().await;
        let payload = r#"{"eventId":"evt-001","categoryId":"cat-001-1","quantityTotal":20,"quantitySold":4,"quantityReserved":1}"#;
        f.dispatcher.handle("capacity-sync", payload).await.unwrap();

        assert_eq!(f.metrics.capacity_syncs.get(), 1);
        let counter = f.store.counter("evt-001", "cat-001-1").await.unwrap().unwrap();
        assert_eq!((counter.total, counter.sold, counter.available), (20, 4, 16));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retried_and_ledger_outage_is() {
        let f = fixture().await;
        let err = f.dispatcher.handle("capacity-sync", "not json").await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));

        let grant = f
            .holds
            .acquire(HoldRequest {
                event_id: "evt-001".into(),
                entries: vec![HoldEntry {
                    event_id: "evt-001".into(),
                    category_id: "cat-001-1".into(),
                    quantity: 1,
                }],
                ..HoldRequest::default()
            })
            .await
            .unwrap();
        f.holds.claim(&grant.hold_token).await.unwrap();
        f.ledger.set_unavailable(true);

        let payload = format!(r#"{{"orderId":"ord-2","holdToken":"{}"}}"#, grant.hold_token);
        let err = f.dispatcher.handle("order-paid", &payload).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[tokio::test]
    async fn test_paid_order_survives_ledger_outage_until_redelivered() {
        let f = fixture().await;
        let grant = f
            .holds
            .acquire(HoldRequest {
                event_id: "evt-001".into(),
                entries: vec![HoldEntry {
                    event_id: "evt-001".into(),
                    category_id: "cat-001-1".into(),
                    quantity: 2,
                }],
                ..HoldRequest::default()
            })
            .await
            .unwrap();
        f.holds.claim(&grant.hold_token).await.unwrap();
        let payload = format!(r#"{{"orderId":"ord-3","holdToken":"{}"}}"#, grant.hold_token);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: std::time::Duration::from_millis(1),
        };

        f.ledger.set_unavailable(true);
        assert_eq!(
            deliver(&f.dispatcher, "order-paid", &payload, policy).await,
            Delivery::Redeliver
        );
        assert_eq!(f.metrics.holds_finalized.get(), 0);
        assert!(f.holds.get(&grant.hold_token).await.unwrap().is_some());

        f.ledger.set_unavailable(false);
        assert_eq!(
            deliver(&f.dispatcher, "order-paid", &payload, policy).await,
            Delivery::Ack
        );
        assert_eq!(f.metrics.holds_finalized.get(), 1);
        let counter = f.store.counter("evt-001", "cat-001-1").await.unwrap().unwrap();
        assert_eq!((counter.pending, counter.sold), (0, 2));
    }

    #[tokio::test]
    async fn test_unknown_topic_is_ignored() {
        let f = fixture().await;
        f.dispatcher.handle("elsewhere", "{}").await.unwrap();
    }
}
