use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use turnstile_shared::pii::redact_opt;
use turnstile_shared::{HoldEntry, QueueEntry, QueueEntryStatus, Selection};
use uuid::Uuid;

use crate::clock::Clock;
use crate::holds::{HoldManager, HoldRequest};
use crate::repository::QueueStore;
use crate::{CoreError, CoreResult, NotFoundKind, Rejection};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// How many entries at the head of a queue may claim at once.
    pub admission_window: u64,
    /// Throughput assumption behind the ETA estimate.
    pub throughput_per_tick: u64,
    pub tick_seconds: u64,
    pub details_ttl_seconds: u64,
    /// Suggested wait returned with `NOT_READY`.
    pub not_ready_retry_seconds: u64,
    pub require_claim_token: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            admission_window: 500,
            throughput_per_tick: 50,
            tick_seconds: 5,
            details_ttl_seconds: 3600,
            not_ready_retry_seconds: 5,
            require_claim_token: false,
        }
    }
}

impl QueueSettings {
    /// `ceil(position / throughput) * tick`. Purely informational.
    pub fn eta_seconds(&self, position: u64) -> u64 {
        let throughput = self.throughput_per_tick.max(1);
        position.div_ceil(throughput) * self.tick_seconds
    }

    fn is_admitted(&self, position: u64) -> bool {
        position <= self.admission_window
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub event_id: String,
    pub selections: Vec<Selection>,
    pub requester_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTicket {
    pub queue_id: String,
    pub claim_token: String,
    pub position: u64,
    pub eta_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_id: String,
    pub status: QueueEntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Only handed out once the entry is inside the admission window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
}

impl QueueStatus {
    fn expired(queue_id: &str) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            status: QueueEntryStatus::Expired,
            position: None,
            eta_seconds: None,
            claim_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueClaim {
    pub queue_id: String,
    pub hold_token: String,
    pub hold_expires_at: DateTime<Utc>,
    pub hold_expires_at_epoch: i64,
}

/// FIFO admission control in front of [`HoldManager::acquire`].
///
/// Nothing is reserved while an entry waits. Readiness is always derived from
/// the live rank; no ready flag is ever stored.
pub struct AdmissionQueue {
    store: Arc<dyn QueueStore>,
    holds: Arc<HoldManager>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl AdmissionQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        holds: Arc<HoldManager>,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            holds,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn enqueue(&self, request: JoinRequest) -> CoreResult<QueueTicket> {
        if request.selections.is_empty() {
            return Err(CoreError::ValidationError("At least one selection is required".to_string()));
        }
        if let Some(bad) = request.selections.iter().find(|s| s.quantity <= 0) {
            return Err(Rejection::InvalidQuantity {
                category_id: bad.category_id.clone(),
            }
            .into());
        }

        let now = self.clock.now();
        let enqueued_at_ms = now.timestamp_millis();
        let entry = QueueEntry {
            queue_id: Uuid::new_v4().to_string(),
            event_id: request.event_id,
            selections: request.selections,
            requester_id: request.requester_id,
            correlation_id: request.correlation_id,
            trace_id: request.trace_id,
            claim_token: Uuid::new_v4().simple().to_string(),
            created_at: now,
            enqueued_at_ms,
        };

        let prune_before_ms = enqueued_at_ms - (self.settings.details_ttl_seconds as i64) * 1000;
        let rank = self
            .store
            .enqueue(&entry, self.settings.details_ttl_seconds, prune_before_ms)
            .await?;
        let position = rank + 1;

        info!(
            "Queue entry {} joined event {} at position {} (requester {})",
            entry.queue_id,
            entry.event_id,
            position,
            redact_opt(entry.requester_id.as_deref())
        );
        Ok(QueueTicket {
            queue_id: entry.queue_id,
            claim_token: entry.claim_token,
            position,
            eta_seconds: self.settings.eta_seconds(position),
        })
    }

    pub async fn status(&self, queue_id: &str) -> CoreResult<QueueStatus> {
        let Some(entry) = self.store.entry(queue_id).await? else {
            return Ok(QueueStatus::expired(queue_id));
        };
        let Some(rank) = self.store.rank(&entry.event_id, queue_id).await? else {
            return Ok(QueueStatus::expired(queue_id));
        };

        let position = rank + 1;
        let ready = self.settings.is_admitted(position);
        Ok(QueueStatus {
            queue_id: queue_id.to_string(),
            status: if ready { QueueEntryStatus::Ready } else { QueueEntryStatus::Queued },
            position: Some(position),
            eta_seconds: Some(if ready { 0 } else { self.settings.eta_seconds(position) }),
            claim_token: ready.then_some(entry.claim_token),
        })
    }

    pub async fn leave(&self, queue_id: &str) -> CoreResult<bool> {
        let Some(entry) = self.store.entry(queue_id).await? else {
            return Ok(false);
        };
        let removed = self.store.remove(&entry.event_id, queue_id).await?;
        if removed {
            info!("Queue entry {} left event {}", queue_id, entry.event_id);
        }
        Ok(removed)
    }

    /// Promotes a ready entry into a hold. The entry is removed before the
    /// acquire so only one concurrent claim of the same id can proceed.
    pub async fn claim(&self, queue_id: &str, claim_token: Option<&str>) -> CoreResult<QueueClaim> {
        let entry = self
            .store
            .entry(queue_id)
            .await?
            .ok_or(CoreError::NotFound(NotFoundKind::QueueExpired))?;

        match claim_token {
            Some(token) if token != entry.claim_token => return Err(Rejection::InvalidClaimToken.into()),
            None if self.settings.require_claim_token => return Err(Rejection::InvalidClaimToken.into()),
            _ => {}
        }

        let rank = self
            .store
            .rank(&entry.event_id, queue_id)
            .await?
            .ok_or(CoreError::NotFound(NotFoundKind::NotInQueue))?;
        let position = rank + 1;
        if !self.settings.is_admitted(position) {
            debug!("Queue entry {} claimed early at position {}", queue_id, position);
            return Err(Rejection::NotReady {
                position,
                retry_after_seconds: self.settings.not_ready_retry_seconds,
            }
            .into());
        }

        if !self.store.remove(&entry.event_id, queue_id).await? {
            return Err(CoreError::NotFound(NotFoundKind::NotInQueue));
        }

        let request = HoldRequest {
            event_id: entry.event_id.clone(),
            entries: entry
                .selections
                .iter()
                .map(|s| HoldEntry {
                    event_id: entry.event_id.clone(),
                    category_id: s.category_id.clone(),
                    quantity: s.quantity,
                })
                .collect(),
            requester_id: entry.requester_id.clone(),
            correlation_id: entry.correlation_id.clone(),
            trace_id: entry.trace_id.clone(),
        };

        match self.holds.acquire(request).await {
            Ok(grant) => {
                info!("Queue entry {} promoted to hold {}", queue_id, grant.hold_token);
                Ok(QueueClaim {
                    queue_id: queue_id.to_string(),
                    hold_token: grant.hold_token,
                    hold_expires_at: grant.expires_at,
                    hold_expires_at_epoch: grant.expires_at_epoch,
                })
            }
            Err(e) if e.is_infrastructure() => {
                warn!("Hold acquisition failed for queue entry {}, restoring slot: {}", queue_id, e);
                if let Err(restore) = self
                    .store
                    .enqueue(&entry, self.settings.details_ttl_seconds, 0)
                    .await
                {
                    warn!("Could not restore queue entry {}: {}", queue_id, restore);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::holds::HoldSettings;
    use crate::memory::MemoryStore;
    use crate::repository::{CounterStore, HoldStore};
    use chrono::Duration;
    use turnstile_shared::InventoryCounter;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        queue: AdmissionQueue,
    }

    async fn fixture(settings: QueueSettings) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store
            .seed(&InventoryCounter::seeded("evt-001", "cat-001-1", 10, 0))
            .await
            .unwrap();
        let holds = Arc::new(HoldManager::new(store.clone(), clock.clone(), HoldSettings::default()));
        let queue = AdmissionQueue::new(store.clone(), holds, clock.clone(), settings);
        Fixture { store, clock, queue }
    }

    fn join(quantity: i64) -> JoinRequest {
        JoinRequest {
            event_id: "evt-001".to_string(),
            selections: vec![Selection {
                category_id: "cat-001-1".to_string(),
                quantity,
            }],
            ..JoinRequest::default()
        }
    }

    /// Joins `n` entries one millisecond apart so enqueue order is unambiguous.
    async fn join_many(f: &Fixture, n: usize) -> Vec<QueueTicket> {
        let mut tickets = Vec::with_capacity(n);
        for _ in 0..n {
            tickets.push(f.queue.enqueue(join(1)).await.unwrap());
            f.clock.advance(Duration::milliseconds(1));
        }
        tickets
    }

    #[tokio::test]
    async fn test_window_boundary_and_promotion_on_leave() {
        let f = fixture(QueueSettings::default()).await;
        let tickets = join_many(&f, 501).await;

        for (i, ticket) in tickets.iter().enumerate() {
            assert_eq!(ticket.position, i as u64 + 1);
        }
        for ticket in &tickets[..500] {
            assert_eq!(f.queue.status(&ticket.queue_id).await.unwrap().status, QueueEntryStatus::Ready);
        }

        let last = f.queue.status(&tickets[500].queue_id).await.unwrap();
        assert_eq!(last.status, QueueEntryStatus::Queued);
        assert_eq!(last.position, Some(501));
        assert!(last.claim_token.is_none());

        assert!(f.queue.leave(&tickets[0].queue_id).await.unwrap());
        let promoted = f.queue.status(&tickets[500].queue_id).await.unwrap();
        assert_eq!(promoted.status, QueueEntryStatus::Ready);
        assert_eq!(promoted.position, Some(500));
        assert_eq!(promoted.claim_token.as_deref(), Some(tickets[500].claim_token.as_str()));
    }

    #[tokio::test]
    async fn test_eta_is_linear_estimate() {
        let settings = QueueSettings::default();
        assert_eq!(settings.eta_seconds(1), 5);
        assert_eq!(settings.eta_seconds(50), 5);
        assert_eq!(settings.eta_seconds(51), 10);
        assert_eq!(settings.eta_seconds(501), 55);
    }

    #[tokio::test]
    async fn test_leave_twice_reports_false() {
        let f = fixture(QueueSettings::default()).await;
        let ticket = f.queue.enqueue(join(1)).await.unwrap();
        assert!(f.queue.leave(&ticket.queue_id).await.unwrap());
        assert!(!f.queue.leave(&ticket.queue_id).await.unwrap());
        assert_eq!(
            f.queue.status(&ticket.queue_id).await.unwrap().status,
            QueueEntryStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_details_expire_after_ttl() {
        let f = fixture(QueueSettings::default()).await;
        let ticket = f.queue.enqueue(join(1)).await.unwrap();
        f.clock.advance(Duration::seconds(3601));
        assert_eq!(
            f.queue.status(&ticket.queue_id).await.unwrap().status,
            QueueEntryStatus::Expired
        );
        assert!(matches!(
            f.queue.claim(&ticket.queue_id, None).await,
            Err(CoreError::NotFound(NotFoundKind::QueueExpired))
        ));
    }

    #[tokio::test]
    async fn test_stale_members_are_pruned_on_enqueue() {
        let f = fixture(QueueSettings::default()).await;
        f.queue.enqueue(join(1)).await.unwrap();
        f.clock.advance(Duration::seconds(3601));
        let fresh = f.queue.enqueue(join(1)).await.unwrap();
        assert_eq!(fresh.position, 1);
    }

    #[tokio::test]
    async fn test_claim_consumes_slot_and_creates_hold() {
        let f = fixture(QueueSettings::default()).await;
        let ticket = f.queue.enqueue(join(2)).await.unwrap();

        let claim = f
            .queue
            .claim(&ticket.queue_id, Some(&ticket.claim_token))
            .await
            .unwrap();
        let hold = f.store.hold(&claim.hold_token).await.unwrap().unwrap();
        assert_eq!(hold.entries[0].quantity, 2);
        assert_eq!(f.store.counter("evt-001", "cat-001-1").await.unwrap().unwrap().pending, 2);

        assert!(matches!(
            f.queue.claim(&ticket.queue_id, Some(&ticket.claim_token)).await,
            Err(CoreError::NotFound(NotFoundKind::QueueExpired))
        ));
    }

    #[tokio::test]
    async fn test_claim_outside_window_is_not_ready() {
        let f = fixture(QueueSettings {
            admission_window: 1,
            ..QueueSettings::default()
        })
        .await;
        let tickets = join_many(&f, 2).await;

        match f.queue.claim(&tickets[1].queue_id, None).await {
            Err(CoreError::Rejected(Rejection::NotReady {
                position,
                retry_after_seconds,
            })) => {
                assert_eq!(position, 2);
                assert_eq!(retry_after_seconds, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_claim_token_checks() {
        let f = fixture(QueueSettings {
            require_claim_token: true,
            ..QueueSettings::default()
        })
        .await;
        let ticket = f.queue.enqueue(join(1)).await.unwrap();

        assert!(matches!(
            f.queue.claim(&ticket.queue_id, Some("guess")).await,
            Err(CoreError::Rejected(Rejection::InvalidClaimToken))
        ));
        assert!(matches!(
            f.queue.claim(&ticket.queue_id, None).await,
            Err(CoreError::Rejected(Rejection::InvalidClaimToken))
        ));
        // Failed checks leave the entry in place.
        assert_eq!(f.queue.status(&ticket.queue_id).await.unwrap().position, Some(1));
    }

    #[tokio::test]
    async fn test_sold_out_claim_still_consumes_entry() {
        let f = fixture(QueueSettings::default()).await;
        let ticket = f.queue.enqueue(join(11)).await.unwrap();

        let err = f.queue.claim(&ticket.queue_id, None).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
        assert_eq!(
            f.queue.status(&ticket.queue_id).await.unwrap().status,
            QueueEntryStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_join_validation() {
        let f = fixture(QueueSettings::default()).await;
        assert!(matches!(
            f.queue.enqueue(JoinRequest::default()).await,
            Err(CoreError::ValidationError(_))
        ));
        assert_eq!(f.queue.enqueue(join(0)).await.unwrap_err().code(), "INVALID_QUANTITY");
    }
}
