use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use turnstile_shared::{HoldEntry, HoldMetadata, HoldRecord, HoldStatus, InventoryCounter, QueueEntry};

use crate::CoreResult;

// ============================================================================
// Commands and outcomes
// ============================================================================

/// Everything the store needs to create a hold in one indivisible step.
#[derive(Debug, Clone)]
pub struct AcquireCommand {
    pub hold_token: String,
    pub entries: Vec<HoldEntry>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Physical lifetime of the record. Longer than the logical expiry.
    pub key_ttl_seconds: u64,
    pub trace_id: Option<String>,
    pub metadata: HoldMetadata,
}

impl AcquireCommand {
    pub fn expires_at_epoch(&self) -> i64 {
        self.expires_at.timestamp()
    }
}

#[derive(Debug, Clone)]
pub struct ExtendCommand {
    pub hold_token: String,
    pub expires_at: DateTime<Utc>,
    pub key_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldGrant {
    pub hold_token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_at_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The hold had already reached a terminal state; nothing changed.
    AlreadyTerminal(HoldStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCategory {
    pub event_id: String,
    pub category_id: String,
    pub quantity_total: i64,
    /// Ledger-side `total - sold`. Confirmed sales are the only thing that moves it.
    pub available_quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerConfirmation {
    /// Entries newly confirmed by this call; zero on a redelivery.
    Confirmed(usize),
    /// The order tied to the hold was cancelled first. Nothing was written.
    OrderCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredOrder {
    pub order_id: String,
    pub hold_token: Option<String>,
}

// ============================================================================
// Fast store
// ============================================================================

/// Per-(event, category) counters. Every method is one atomic operation.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn counter(&self, event_id: &str, category_id: &str) -> CoreResult<Option<InventoryCounter>>;

    /// Overwrites the counter unconditionally. Operator seeding only.
    async fn seed(&self, counter: &InventoryCounter) -> CoreResult<()>;

    /// Writes the counter only if none exists. Returns whether it was written.
    async fn populate_if_absent(&self, counter: &InventoryCounter) -> CoreResult<bool>;

    /// Overwrites total/sold/reserved and recomputes `available` from the live
    /// `pending`. Returns the new `available`.
    async fn sync(
        &self,
        event_id: &str,
        category_id: &str,
        total: i64,
        sold: i64,
        reserved: i64,
    ) -> CoreResult<i64>;
}

/// Hold ledger plus its expiry index. Each method is one scripted transaction
/// spanning the hold record, the index and every counter the hold references.
#[async_trait]
pub trait HoldStore: Send + Sync {
    async fn acquire(&self, cmd: &AcquireCommand) -> CoreResult<HoldGrant>;

    async fn claim(&self, hold_token: &str, claimed_ttl_seconds: u64) -> CoreResult<Vec<HoldEntry>>;

    async fn release(&self, hold_token: &str) -> CoreResult<ReleaseOutcome>;

    async fn finalize(&self, hold_token: &str) -> CoreResult<()>;

    /// Returns false when the hold no longer exists. Never recreates it.
    /// Only a held hold can be extended; anything else is `HoldNotActive`.
    async fn extend(&self, cmd: &ExtendCommand) -> CoreResult<bool>;

    async fn hold(&self, hold_token: &str) -> CoreResult<Option<HoldRecord>>;

    /// Releases up to `limit` holds whose index score is `<= now_epoch`. The
    /// stock comes back even when the record has already been evicted.
    async fn sweep_expired(&self, now_epoch: i64, limit: usize) -> CoreResult<usize>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores the details blob, drops ordering members scored before
    /// `prune_before_ms`, and inserts the entry. Returns the 0-based rank.
    async fn enqueue(&self, entry: &QueueEntry, ttl_seconds: u64, prune_before_ms: i64) -> CoreResult<u64>;

    async fn entry(&self, queue_id: &str) -> CoreResult<Option<QueueEntry>>;

    /// 0-based rank in the event's ordering set.
    async fn rank(&self, event_id: &str, queue_id: &str) -> CoreResult<Option<u64>>;

    /// Removes both the ordering member and the details blob.
    async fn remove(&self, event_id: &str, queue_id: &str) -> CoreResult<bool>;
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Sliding-window check-and-record against a time-scored set.
    async fn record_hit(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        now: f64,
        member: &str,
    ) -> CoreResult<RateDecision>;
}

// ============================================================================
// Authoritative ledger
// ============================================================================

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn categories(&self, event_id: &str) -> CoreResult<Vec<LedgerCategory>>;

    /// Sum of unexpired, still-active reservation quantities.
    async fn active_reservations(&self, event_id: &str, category_id: &str, now: DateTime<Utc>) -> CoreResult<i64>;

    /// In one transaction: mark the hold's pending order paid, confirm a
    /// reservation row per entry keyed by the hold token and decrement
    /// `available_quantity` for rows that were not already confirmed.
    ///
    /// Serializes with [`expire_pending_orders`](Self::expire_pending_orders)
    /// on the order row: once an order is paid it is never expired, and once
    /// it is cancelled it is never confirmed.
    async fn confirm_hold(&self, hold_token: &str, entries: &[HoldEntry]) -> CoreResult<LedgerConfirmation>;

    /// Cancels unpaid orders past their expiry and returns them.
    async fn expire_pending_orders(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<ExpiredOrder>>;
}
