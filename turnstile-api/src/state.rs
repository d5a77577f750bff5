use std::sync::Arc;
use turnstile_core::clock::Clock;
use turnstile_core::holds::{HoldManager, HoldSettings};
use turnstile_core::inventory::InventoryService;
use turnstile_core::queue::{AdmissionQueue, QueueSettings};
use turnstile_core::rate_limit::{RateLimitAction, RateLimitSettings, RateLimiter};
use turnstile_core::repository::{CounterStore, HoldStore, LedgerRepository, QueueStore, RateLimitStore};

use crate::error::AppError;
use crate::metrics::Metrics;

#[derive(Clone, Debug, Default)]
pub struct EngineSettings {
    pub holds: HoldSettings,
    pub queue: QueueSettings,
    pub rate_limits: RateLimitSettings,
}

#[derive(Clone)]
pub struct AppState {
    pub holds: Arc<HoldManager>,
    pub queue: Arc<AdmissionQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub inventory: Arc<InventoryService>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wires every service onto one fast store (Redis in production, the
    /// in-process store in tests) and the ledger.
    pub fn build<S>(
        store: Arc<S>,
        ledger: Arc<dyn LedgerRepository>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        metrics: Arc<Metrics>,
    ) -> Self
    where
        S: CounterStore + HoldStore + QueueStore + RateLimitStore + 'static,
    {
        let holds = Arc::new(HoldManager::new(
            store.clone() as Arc<dyn HoldStore>,
            clock.clone(),
            settings.holds,
        ));
        let queue = Arc::new(AdmissionQueue::new(
            store.clone() as Arc<dyn QueueStore>,
            holds.clone(),
            clock.clone(),
            settings.queue,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone() as Arc<dyn RateLimitStore>,
            clock.clone(),
            settings.rate_limits,
        ));
        let inventory = Arc::new(InventoryService::new(store as Arc<dyn CounterStore>, ledger, clock));

        Self {
            holds,
            queue,
            rate_limiter,
            inventory,
            metrics,
        }
    }
}

impl AppState {
    /// Rejects with 429 once the caller exhausts the action's window.
    pub async fn enforce_rate_limit(&self, action: RateLimitAction, identifier: &str) -> Result<(), AppError> {
        let decision = self.rate_limiter.check(action, identifier).await;
        if decision.allowed {
            return Ok(());
        }
        self.metrics
            .rate_limit_hits
            .with_label_values(&[action.as_str()])
            .inc();
        Err(AppError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds,
        })
    }
}
