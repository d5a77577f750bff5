use chrono::Duration;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use turnstile_shared::pii::redact_opt;
use turnstile_shared::{HoldEntry, HoldMetadata, HoldRecord};
use uuid::Uuid;

use crate::clock::Clock;
use crate::repository::{AcquireCommand, ExtendCommand, HoldGrant, HoldStore, ReleaseOutcome};
use crate::{CoreError, CoreResult, NotFoundKind};

pub const MIN_HOLD_TTL_SECONDS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HoldSettings {
    /// Logical hold lifetime. Floored at [`MIN_HOLD_TTL_SECONDS`].
    pub ttl_seconds: u64,
    /// Extra physical lifetime of the record past its logical expiry.
    pub key_grace_seconds: u64,
    /// Physical lifetime of a claimed hold while checkout runs.
    pub claimed_ttl_seconds: u64,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 600,
            key_grace_seconds: 60,
            claimed_ttl_seconds: 3600,
        }
    }
}

impl HoldSettings {
    pub fn effective_ttl(&self) -> u64 {
        self.ttl_seconds.max(MIN_HOLD_TTL_SECONDS)
    }

    /// Upper bound accepted for a single extension.
    pub fn max_extend_seconds(&self) -> u64 {
        self.effective_ttl() * 2
    }
}

#[derive(Debug, Clone, Default)]
pub struct HoldRequest {
    pub event_id: String,
    pub entries: Vec<HoldEntry>,
    pub requester_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Owns every hold state transition:
///
/// ```text
/// held --claim--> claimed --mark_committed--> finalized (deleted)
/// held | claimed --release--> released (deleted)
/// held --sweeper--> released (deleted)
/// ```
///
/// Each transition is a single store transaction, so no two transitions for the
/// same token can interleave and counters never go negative.
pub struct HoldManager {
    store: Arc<dyn HoldStore>,
    clock: Arc<dyn Clock>,
    settings: HoldSettings,
}

impl HoldManager {
    pub fn new(store: Arc<dyn HoldStore>, clock: Arc<dyn Clock>, settings: HoldSettings) -> Self {
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> &HoldSettings {
        &self.settings
    }

    pub async fn acquire(&self, request: HoldRequest) -> CoreResult<HoldGrant> {
        if request.entries.is_empty() {
            return Err(CoreError::ValidationError("At least one selection is required".to_string()));
        }
        if let Some(bad) = request.entries.iter().find(|e| e.event_id != request.event_id) {
            return Err(CoreError::ValidationError(format!(
                "Entry for category {} belongs to event {}, not {}",
                bad.category_id, bad.event_id, request.event_id
            )));
        }

        let ttl = self.settings.effective_ttl();
        let now = self.clock.now();
        let cmd = AcquireCommand {
            hold_token: Uuid::new_v4().to_string(),
            entries: merge_entries(request.entries),
            created_at: now,
            expires_at: now + Duration::seconds(ttl as i64),
            key_ttl_seconds: ttl + self.settings.key_grace_seconds,
            trace_id: request.trace_id,
            metadata: HoldMetadata {
                requester_id: request.requester_id,
                correlation_id: request.correlation_id,
            },
        };

        match self.store.acquire(&cmd).await {
            Ok(grant) => {
                info!(
                    "Hold {} acquired for event {} ({} categories, requester {})",
                    grant.hold_token,
                    request.event_id,
                    cmd.entries.len(),
                    redact_opt(cmd.metadata.requester_id.as_deref())
                );
                Ok(grant)
            }
            Err(e) => {
                if e.is_infrastructure() {
                    warn!("Hold acquisition failed closed for event {}: {}", request.event_id, e);
                } else {
                    debug!("Hold rejected for event {}: {}", request.event_id, e);
                }
                Err(e)
            }
        }
    }

    /// Moves a hold from held to claimed and returns its entries. The caller
    /// owns the rest of the lifecycle and must release or commit it.
    pub async fn claim(&self, hold_token: &str) -> CoreResult<Vec<HoldEntry>> {
        let entries = self
            .store
            .claim(hold_token, self.settings.claimed_ttl_seconds)
            .await?;
        info!("Hold {} claimed", hold_token);
        Ok(entries)
    }

    pub async fn release(&self, hold_token: &str) -> CoreResult<ReleaseOutcome> {
        let outcome = self.store.release(hold_token).await?;
        match outcome {
            ReleaseOutcome::Released => info!("Hold {} released", hold_token),
            ReleaseOutcome::AlreadyTerminal(status) => {
                debug!("Hold {} already {}, release is a no-op", hold_token, status)
            }
        }
        Ok(outcome)
    }

    /// Converts a claimed hold into sold inventory. `Ok(false)` means the hold
    /// is already gone, which is what a duplicate delivery sees.
    pub async fn mark_committed(&self, hold_token: &str) -> CoreResult<bool> {
        match self.store.finalize(hold_token).await {
            Ok(()) => {
                info!("Hold {} finalized", hold_token);
                Ok(true)
            }
            Err(CoreError::NotFound(NotFoundKind::Hold)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pushes the expiry of a held hold. `Ok(false)` means the hold is gone;
    /// a claimed hold is rejected and keeps its checkout lifetime.
    pub async fn extend(&self, hold_token: &str, seconds: u64) -> CoreResult<bool> {
        if seconds == 0 || seconds > self.settings.max_extend_seconds() {
            return Err(CoreError::ValidationError(format!(
                "extendSeconds must be between 1 and {}",
                self.settings.max_extend_seconds()
            )));
        }
        let cmd = ExtendCommand {
            hold_token: hold_token.to_string(),
            expires_at: self.clock.now() + Duration::seconds(seconds as i64),
            key_ttl_seconds: seconds + self.settings.key_grace_seconds,
        };
        let extended = self.store.extend(&cmd).await?;
        if extended {
            debug!("Hold {} extended by {}s", hold_token, seconds);
        }
        Ok(extended)
    }

    pub async fn get(&self, hold_token: &str) -> CoreResult<Option<HoldRecord>> {
        self.store.hold(hold_token).await
    }
}

/// Folds repeated categories into one entry so a cart cannot pass the stock
/// check twice against the same counter.
fn merge_entries(entries: Vec<HoldEntry>) -> Vec<HoldEntry> {
    let mut merged: Vec<HoldEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match merged
            .iter_mut()
            .find(|m| m.event_id == entry.event_id && m.category_id == entry.category_id)
        {
            Some(existing) if entry.quantity > 0 && existing.quantity > 0 => existing.quantity += entry.quantity,
            _ => merged.push(entry),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::repository::CounterStore;
    use crate::Rejection;
    use std::collections::HashSet;
    use turnstile_shared::{HoldStatus, InventoryCounter};

    fn entry(category_id: &str, quantity: i64) -> HoldEntry {
        HoldEntry {
            event_id: "evt-001".to_string(),
            category_id: category_id.to_string(),
            quantity,
        }
    }

    fn request(entries: Vec<HoldEntry>) -> HoldRequest {
        HoldRequest {
            event_id: "evt-001".to_string(),
            entries,
            requester_id: Some("user-1".to_string()),
            ..HoldRequest::default()
        }
    }

    async fn setup(total: i64) -> (Arc<MemoryStore>, HoldManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store
            .seed(&InventoryCounter::seeded("evt-001", "cat-001-1", total, 0))
            .await
            .unwrap();
        let manager = HoldManager::new(store.clone(), clock.clone(), HoldSettings::default());
        (store, manager, clock)
    }

    async fn counter(store: &MemoryStore, category_id: &str) -> InventoryCounter {
        store.counter("evt-001", category_id).await.unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_never_oversell() {
        let (store, manager, _) = setup(10).await;
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..15 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(request(vec![entry("cat-001-1", 1)])).await
            }));
        }

        let mut tokens = HashSet::new();
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(grant) => {
                    tokens.insert(grant.hold_token);
                }
                Err(CoreError::Rejected(Rejection::InsufficientStock { available, .. })) => {
                    assert_eq!(available, 0);
                    failures += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(tokens.len(), 10);
        assert_eq!(failures, 5);
        let c = counter(&store, "cat-001-1").await;
        assert_eq!((c.available, c.pending, c.sold), (0, 10, 0));
    }

    #[tokio::test]
    async fn test_multi_category_acquire_is_all_or_nothing() {
        let (store, manager, _) = setup(10).await;
        store
            .seed(&InventoryCounter::seeded("evt-001", "cat-001-2", 2, 0))
            .await
            .unwrap();

        let err = manager
            .acquire(request(vec![entry("cat-001-1", 3), entry("cat-001-2", 5)]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            CoreError::Rejected(Rejection::InsufficientStock {
                category_id: "cat-001-2".into(),
                available: 2
            })
            .to_string()
        );

        let first = counter(&store, "cat-001-1").await;
        let second = counter(&store, "cat-001-2").await;
        assert_eq!((first.available, first.pending), (10, 0));
        assert_eq!((second.available, second.pending), (2, 0));
    }

    #[tokio::test]
    async fn test_repeated_category_is_checked_as_one_quantity() {
        let (store, manager, _) = setup(10).await;

        let err = manager
            .acquire(request(vec![entry("cat-001-1", 6), entry("cat-001-1", 6)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
        assert_eq!(counter(&store, "cat-001-1").await.available, 10);
    }

    #[tokio::test]
    async fn test_invalid_quantity_names_category() {
        let (_, manager, _) = setup(10).await;
        let err = manager
            .acquire(request(vec![entry("cat-001-1", 0)]))
            .await
            .unwrap_err();
        match err {
            CoreError::Rejected(Rejection::InvalidQuantity { category_id }) => assert_eq!(category_id, "cat-001-1"),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_or_foreign_entries_fail_validation() {
        let (_, manager, _) = setup(10).await;
        assert!(matches!(
            manager.acquire(request(vec![])).await,
            Err(CoreError::ValidationError(_))
        ));

        let mut foreign = entry("cat-001-1", 1);
        foreign.event_id = "evt-999".into();
        assert!(matches!(
            manager.acquire(request(vec![foreign])).await,
            Err(CoreError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_release_restores_exactly_what_was_reserved() {
        let (store, manager, _) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 5)])).await.unwrap();
        assert_eq!(counter(&store, "cat-001-1").await.available, 5);

        assert_eq!(manager.release(&grant.hold_token).await.unwrap(), ReleaseOutcome::Released);
        let c = counter(&store, "cat-001-1").await;
        assert_eq!((c.available, c.pending), (10, 0));

        assert!(matches!(
            manager.release(&grant.hold_token).await,
            Err(CoreError::NotFound(NotFoundKind::Hold))
        ));
    }

    #[tokio::test]
    async fn test_claim_then_commit_moves_pending_to_sold() {
        let (store, manager, _) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 1)])).await.unwrap();
        let c = counter(&store, "cat-001-1").await;
        assert_eq!((c.available, c.pending), (9, 1));

        let entries = manager.claim(&grant.hold_token).await.unwrap();
        assert_eq!(entries, vec![entry("cat-001-1", 1)]);
        assert_eq!(store.indexed_holds(), 0);

        assert!(manager.mark_committed(&grant.hold_token).await.unwrap());
        let c = counter(&store, "cat-001-1").await;
        assert_eq!((c.available, c.pending, c.sold), (9, 0, 1));

        // Second delivery finds nothing and credits nothing.
        assert!(!manager.mark_committed(&grant.hold_token).await.unwrap());
        assert_eq!(counter(&store, "cat-001-1").await.sold, 1);
    }

    #[tokio::test]
    async fn test_claim_only_once_and_commit_requires_claim() {
        let (_, manager, _) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 1)])).await.unwrap();

        let err = manager.mark_committed(&grant.hold_token).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(Rejection::HoldNotClaimed { status: HoldStatus::Held })
        ));

        manager.claim(&grant.hold_token).await.unwrap();
        let err = manager.claim(&grant.hold_token).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(Rejection::HoldNotActive { status: HoldStatus::Claimed })
        ));

        let stored = manager.get(&grant.hold_token).await.unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Claimed);
    }

    #[tokio::test]
    async fn test_claimed_hold_can_still_be_released() {
        let (store, manager, _) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 4)])).await.unwrap();
        manager.claim(&grant.hold_token).await.unwrap();
        manager.release(&grant.hold_token).await.unwrap();
        let c = counter(&store, "cat-001-1").await;
        assert_eq!((c.available, c.pending), (10, 0));
    }

    #[tokio::test]
    async fn test_extend_refreshes_expiry_but_never_recreates() {
        let (_, manager, clock) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 1)])).await.unwrap();

        clock.advance(Duration::seconds(300));
        assert!(manager.extend(&grant.hold_token, 900).await.unwrap());
        let record = manager.get(&grant.hold_token).await.unwrap().unwrap();
        assert_eq!(record.expires_at_epoch, grant.expires_at_epoch - 600 + 300 + 900);

        assert!(!manager.extend("missing-token", 60).await.unwrap());
        assert!(matches!(
            manager.extend(&grant.hold_token, 0).await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(matches!(
            manager.extend(&grant.hold_token, 1201).await,
            Err(CoreError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_extend_rejects_claimed_hold_and_keeps_its_lifetime() {
        let (store, manager, clock) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 2)])).await.unwrap();
        manager.claim(&grant.hold_token).await.unwrap();

        let err = manager.extend(&grant.hold_token, 60).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Rejected(Rejection::HoldNotActive { status: HoldStatus::Claimed })
        ));
        assert_eq!(store.indexed_holds(), 0);

        clock.advance(Duration::seconds(300));
        let stored = manager.get(&grant.hold_token).await.unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Claimed);
        assert_eq!(counter(&store, "cat-001-1").await.pending, 2);

        manager.release(&grant.hold_token).await.unwrap();
        assert_eq!(counter(&store, "cat-001-1").await.available, 10);
    }

    #[tokio::test]
    async fn test_hold_record_outlives_logical_expiry_by_grace() {
        let (_, manager, clock) = setup(10).await;
        let grant = manager.acquire(request(vec![entry("cat-001-1", 1)])).await.unwrap();

        clock.advance(Duration::seconds(630));
        assert!(manager.get(&grant.hold_token).await.unwrap().is_some());

        clock.advance(Duration::seconds(60));
        assert!(manager.get(&grant.hold_token).await.unwrap().is_none());
    }

    #[test]
    fn test_ttl_floor() {
        let settings = HoldSettings {
            ttl_seconds: 5,
            ..HoldSettings::default()
        };
        assert_eq!(settings.effective_ttl(), 60);
        assert_eq!(settings.max_extend_seconds(), 120);
    }

    #[test]
    fn test_merge_entries_sums_repeats_in_order() {
        let merged = merge_entries(vec![entry("b", 1), entry("a", 2), entry("b", 3)]);
        assert_eq!(merged, vec![entry("b", 4), entry("a", 2)]);
    }
}
