//! In-process implementations of every store seam.
//!
//! One mutex guards all state and is held for the whole of each operation, so
//! every call is indivisible with respect to every other call. That is the same
//! guarantee the Redis scripts give, which makes this a faithful stand-in for
//! tests and for running a single node without Redis. Physical TTLs are
//! evaluated lazily against the injected [`Clock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use turnstile_shared::{HoldEntry, HoldRecord, HoldStatus, InventoryCounter, QueueEntry};

use crate::clock::Clock;
use crate::repository::{
    AcquireCommand, CounterStore, ExpiredOrder, ExtendCommand, HoldGrant, HoldStore, LedgerCategory,
    LedgerConfirmation, LedgerRepository, QueueStore, RateDecision, RateLimitStore, ReleaseOutcome,
};
use crate::{CoreError, CoreResult, NotFoundKind, Rejection};

/// Score-ordered set with Redis ZSET semantics (ties broken by member).
#[derive(Debug, Default)]
struct SortedSet {
    by_member: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.by_member.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn rank(&self, member: &str) -> Option<u64> {
        let score = *self.by_member.get(member)?;
        Some(self.ordered.range(..(score, member.to_string())).count() as u64)
    }

    fn up_to(&self, max_score: i64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn remove_below(&mut self, min_score: i64) {
        let stale: Vec<String> = self
            .ordered
            .iter()
            .take_while(|(score, _)| *score < min_score)
            .map(|(_, member)| member.clone())
            .collect();
        for member in stale {
            self.remove(&member);
        }
    }
}

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    purge_at: i64,
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<(String, String), InventoryCounter>,
    holds: HashMap<String, Expiring<HoldRecord>>,
    expiry_index: SortedSet,
    /// Entries of every indexed hold. Outlives the record so a late sweep can
    /// still return the stock.
    indexed_entries: HashMap<String, Vec<HoldEntry>>,
    queues: HashMap<String, SortedSet>,
    queue_entries: HashMap<String, Expiring<QueueEntry>>,
    rate_windows: HashMap<String, Vec<f64>>,
}

impl State {
    fn counter_mut(&mut self, event_id: &str, category_id: &str) -> &mut InventoryCounter {
        self.counters
            .entry((event_id.to_string(), category_id.to_string()))
            .or_insert_with(|| InventoryCounter {
                event_id: event_id.to_string(),
                category_id: category_id.to_string(),
                ..InventoryCounter::default()
            })
    }

    fn available(&self, event_id: &str, category_id: &str) -> i64 {
        self.counters
            .get(&(event_id.to_string(), category_id.to_string()))
            .map(|c| c.available)
            .unwrap_or(0)
    }

    /// Drops the record if its physical TTL has lapsed, like key eviction would.
    fn live_hold(&mut self, token: &str, now: i64) -> Option<&mut HoldRecord> {
        if self.holds.get(token).is_some_and(|h| h.purge_at <= now) {
            self.holds.remove(token);
        }
        self.holds.get_mut(token).map(|h| &mut h.value)
    }

    fn return_to_pool(&mut self, entries: &[HoldEntry]) {
        for entry in entries {
            let counter = self.counter_mut(&entry.event_id, &entry.category_id);
            counter.available += entry.quantity;
            counter.pending -= entry.quantity;
            counter.version += 1;
        }
    }

    fn unindex(&mut self, token: &str) {
        self.expiry_index.remove(token);
        self.indexed_entries.remove(token);
    }

    fn live_queue_entry(&mut self, queue_id: &str, now: i64) -> Option<&QueueEntry> {
        if self.queue_entries.get(queue_id).is_some_and(|e| e.purge_at <= now) {
            self.queue_entries.remove(queue_id);
        }
        self.queue_entries.get(queue_id).map(|e| &e.value)
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of holds currently in the expiry index.
    pub fn indexed_holds(&self) -> usize {
        self.state().expiry_index.by_member.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn counter(&self, event_id: &str, category_id: &str) -> CoreResult<Option<InventoryCounter>> {
        Ok(self
            .state()
            .counters
            .get(&(event_id.to_string(), category_id.to_string()))
            .cloned())
    }

    async fn seed(&self, counter: &InventoryCounter) -> CoreResult<()> {
        self.state().counters.insert(
            (counter.event_id.clone(), counter.category_id.clone()),
            counter.clone(),
        );
        Ok(())
    }

    async fn populate_if_absent(&self, counter: &InventoryCounter) -> CoreResult<bool> {
        let mut state = self.state();
        let key = (counter.event_id.clone(), counter.category_id.clone());
        if state.counters.contains_key(&key) {
            return Ok(false);
        }
        state.counters.insert(key, counter.clone());
        Ok(true)
    }

    async fn sync(
        &self,
        event_id: &str,
        category_id: &str,
        total: i64,
        sold: i64,
        reserved: i64,
    ) -> CoreResult<i64> {
        let mut state = self.state();
        let counter = state.counter_mut(event_id, category_id);
        counter.total = total;
        counter.sold = sold;
        counter.reserved = reserved;
        counter.recompute_available();
        counter.version += 1;
        Ok(counter.available)
    }
}

#[async_trait]
impl HoldStore for MemoryStore {
    async fn acquire(&self, cmd: &AcquireCommand) -> CoreResult<HoldGrant> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        if state.live_hold(&cmd.hold_token, now).is_some() {
            return Err(Rejection::HoldAlreadyExists.into());
        }

        // Check every entry before touching anything.
        let mut requested: HashMap<(&str, &str), i64> = HashMap::new();
        for entry in &cmd.entries {
            if entry.quantity <= 0 {
                return Err(Rejection::InvalidQuantity {
                    category_id: entry.category_id.clone(),
                }
                .into());
            }
            let wanted = requested
                .entry((entry.event_id.as_str(), entry.category_id.as_str()))
                .or_insert(0);
            *wanted += entry.quantity;
            let available = state.available(&entry.event_id, &entry.category_id);
            if available < *wanted {
                return Err(Rejection::InsufficientStock {
                    category_id: entry.category_id.clone(),
                    available,
                }
                .into());
            }
        }

        for entry in &cmd.entries {
            let counter = state.counter_mut(&entry.event_id, &entry.category_id);
            counter.available -= entry.quantity;
            counter.pending += entry.quantity;
            counter.version += 1;
        }

        let record = HoldRecord {
            token: cmd.hold_token.clone(),
            status: HoldStatus::Held,
            entries: cmd.entries.clone(),
            created_at: cmd.created_at,
            expires_at: cmd.expires_at,
            expires_at_epoch: cmd.expires_at_epoch(),
            trace_id: cmd.trace_id.clone(),
            metadata: cmd.metadata.clone(),
        };
        state.holds.insert(
            cmd.hold_token.clone(),
            Expiring {
                value: record,
                purge_at: now + cmd.key_ttl_seconds as i64,
            },
        );
        state.expiry_index.insert(&cmd.hold_token, cmd.expires_at_epoch());
        state.indexed_entries.insert(cmd.hold_token.clone(), cmd.entries.clone());

        Ok(HoldGrant {
            hold_token: cmd.hold_token.clone(),
            expires_at: cmd.expires_at,
            expires_at_epoch: cmd.expires_at_epoch(),
        })
    }

    async fn claim(&self, hold_token: &str, claimed_ttl_seconds: u64) -> CoreResult<Vec<HoldEntry>> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        let record = state
            .live_hold(hold_token, now)
            .ok_or(CoreError::NotFound(NotFoundKind::Hold))?;
        if record.token != hold_token {
            return Err(Rejection::InvalidToken.into());
        }
        if record.status != HoldStatus::Held {
            return Err(Rejection::HoldNotActive { status: record.status }.into());
        }
        record.status = HoldStatus::Claimed;
        let entries = record.entries.clone();

        state.unindex(hold_token);
        if let Some(stored) = state.holds.get_mut(hold_token) {
            stored.purge_at = now + claimed_ttl_seconds as i64;
        }
        Ok(entries)
    }

    async fn release(&self, hold_token: &str) -> CoreResult<ReleaseOutcome> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        let record = state
            .live_hold(hold_token, now)
            .ok_or(CoreError::NotFound(NotFoundKind::Hold))?;
        if !record.status.reserves_inventory() {
            return Ok(ReleaseOutcome::AlreadyTerminal(record.status));
        }
        let entries = record.entries.clone();

        state.return_to_pool(&entries);
        state.holds.remove(hold_token);
        state.unindex(hold_token);
        Ok(ReleaseOutcome::Released)
    }

    async fn finalize(&self, hold_token: &str) -> CoreResult<()> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        let record = state
            .live_hold(hold_token, now)
            .ok_or(CoreError::NotFound(NotFoundKind::Hold))?;
        if record.status != HoldStatus::Claimed {
            return Err(Rejection::HoldNotClaimed { status: record.status }.into());
        }
        let entries = record.entries.clone();

        for entry in &entries {
            let counter = state.counter_mut(&entry.event_id, &entry.category_id);
            counter.pending -= entry.quantity;
            counter.sold += entry.quantity;
            counter.version += 1;
        }
        state.holds.remove(hold_token);
        state.unindex(hold_token);
        Ok(())
    }

    async fn extend(&self, cmd: &ExtendCommand) -> CoreResult<bool> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        match state.live_hold(&cmd.hold_token, now) {
            Some(record) if record.status != HoldStatus::Held => {
                return Err(Rejection::HoldNotActive { status: record.status }.into());
            }
            Some(record) => {
                record.expires_at = cmd.expires_at;
                record.expires_at_epoch = cmd.expires_at.timestamp();
            }
            None => return Ok(false),
        }
        if let Some(stored) = state.holds.get_mut(&cmd.hold_token) {
            stored.purge_at = now + cmd.key_ttl_seconds as i64;
        }
        state.expiry_index.insert(&cmd.hold_token, cmd.expires_at.timestamp());
        Ok(true)
    }

    async fn hold(&self, hold_token: &str) -> CoreResult<Option<HoldRecord>> {
        let now = self.clock.now_epoch();
        Ok(self.state().live_hold(hold_token, now).map(|r| r.clone()))
    }

    async fn sweep_expired(&self, now_epoch: i64, limit: usize) -> CoreResult<usize> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        let expired = state.expiry_index.up_to(now_epoch, limit);
        for token in &expired {
            let entries = match state.indexed_entries.remove(token) {
                Some(entries) => Some(entries),
                None => state.live_hold(token, now).map(|r| r.entries.clone()),
            };
            if let Some(entries) = entries {
                state.return_to_pool(&entries);
            }
            state.holds.remove(token);
            state.unindex(token);
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, entry: &QueueEntry, ttl_seconds: u64, prune_before_ms: i64) -> CoreResult<u64> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        state.queue_entries.insert(
            entry.queue_id.clone(),
            Expiring {
                value: entry.clone(),
                purge_at: now + ttl_seconds as i64,
            },
        );
        let set = state.queues.entry(entry.event_id.clone()).or_default();
        set.remove_below(prune_before_ms);
        set.insert(&entry.queue_id, entry.enqueued_at_ms);
        Ok(set.rank(&entry.queue_id).unwrap_or(0))
    }

    async fn entry(&self, queue_id: &str) -> CoreResult<Option<QueueEntry>> {
        let now = self.clock.now_epoch();
        Ok(self.state().live_queue_entry(queue_id, now).cloned())
    }

    async fn rank(&self, event_id: &str, queue_id: &str) -> CoreResult<Option<u64>> {
        Ok(self.state().queues.get(event_id).and_then(|set| set.rank(queue_id)))
    }

    async fn remove(&self, event_id: &str, queue_id: &str) -> CoreResult<bool> {
        let now = self.clock.now_epoch();
        let mut state = self.state();

        let had_details = state.live_queue_entry(queue_id, now).is_some();
        state.queue_entries.remove(queue_id);
        let had_member = state
            .queues
            .get_mut(event_id)
            .map(|set| set.remove(queue_id))
            .unwrap_or(false);
        Ok(had_details || had_member)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn record_hit(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        now: f64,
        _member: &str,
    ) -> CoreResult<RateDecision> {
        let mut state = self.state();
        let window = window_seconds as f64;
        let hits = state.rate_windows.entry(key.to_string()).or_default();
        hits.retain(|at| *at > now - window);

        let count = hits.len() as u64;
        if count < limit {
            hits.push(now);
            return Ok(RateDecision {
                allowed: true,
                remaining: limit - count - 1,
                retry_after_seconds: 0,
            });
        }

        let oldest = hits.iter().copied().fold(f64::INFINITY, f64::min);
        let retry_after = (oldest + window - now).ceil().max(0.0) as u64;
        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            retry_after_seconds: retry_after,
        })
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReservation {
    pub hold_token: String,
    pub event_id: String,
    pub category_id: String,
    pub quantity: i64,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOrder {
    pub order_id: String,
    pub hold_token: Option<String>,
    pub status: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    categories: HashMap<(String, String), LedgerCategory>,
    reservations: HashMap<(String, String), LedgerReservation>,
    orders: HashMap<String, LedgerOrder>,
    unavailable: bool,
}

/// Ledger double with the same transactional shape as the Postgres ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(state: &LedgerState) -> CoreResult<()> {
        if state.unavailable {
            return Err(CoreError::LedgerError("ledger unavailable".to_string()));
        }
        Ok(())
    }

    pub fn upsert_category(&self, event_id: &str, category_id: &str, quantity_total: i64, available_quantity: i64) {
        self.state().categories.insert(
            (event_id.to_string(), category_id.to_string()),
            LedgerCategory {
                event_id: event_id.to_string(),
                category_id: category_id.to_string(),
                quantity_total,
                available_quantity,
            },
        );
    }

    pub fn category(&self, event_id: &str, category_id: &str) -> Option<LedgerCategory> {
        self.state()
            .categories
            .get(&(event_id.to_string(), category_id.to_string()))
            .cloned()
    }

    pub fn add_reservation(&self, reservation: LedgerReservation) {
        self.state().reservations.insert(
            (reservation.hold_token.clone(), reservation.category_id.clone()),
            reservation,
        );
    }

    pub fn reservation(&self, hold_token: &str, category_id: &str) -> Option<LedgerReservation> {
        self.state()
            .reservations
            .get(&(hold_token.to_string(), category_id.to_string()))
            .cloned()
    }

    pub fn add_order(&self, order: LedgerOrder) {
        self.state().orders.insert(order.order_id.clone(), order);
    }

    pub fn order(&self, order_id: &str) -> Option<LedgerOrder> {
        self.state().orders.get(order_id).cloned()
    }

    /// Makes every subsequent call fail with a ledger error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }
}

#[async_trait]
impl LedgerRepository for MemoryLedger {
    async fn categories(&self, event_id: &str) -> CoreResult<Vec<LedgerCategory>> {
        let state = self.state();
        Self::check_available(&state)?;
        let mut categories: Vec<LedgerCategory> = state
            .categories
            .values()
            .filter(|c| c.event_id == event_id)
            .cloned()
            .collect();
        categories.sort_by(|a, b| a.category_id.cmp(&b.category_id));
        Ok(categories)
    }

    async fn active_reservations(&self, event_id: &str, category_id: &str, now: DateTime<Utc>) -> CoreResult<i64> {
        let state = self.state();
        Self::check_available(&state)?;
        Ok(state
            .reservations
            .values()
            .filter(|r| {
                r.event_id == event_id && r.category_id == category_id && r.status == "active" && r.expires_at > now
            })
            .map(|r| r.quantity)
            .sum())
    }

    async fn confirm_hold(&self, hold_token: &str, entries: &[HoldEntry]) -> CoreResult<LedgerConfirmation> {
        let mut state = self.state();
        Self::check_available(&state)?;

        let orders = state
            .orders
            .values_mut()
            .filter(|o| o.hold_token.as_deref() == Some(hold_token));
        let mut cancelled = false;
        for order in orders {
            match order.status.as_str() {
                "cancelled" => cancelled = true,
                "pending_payment" => order.status = "paid".to_string(),
                _ => {}
            }
        }
        if cancelled {
            return Ok(LedgerConfirmation::OrderCancelled);
        }

        let mut applied = 0;
        for entry in entries {
            let key = (hold_token.to_string(), entry.category_id.clone());
            if state.reservations.get(&key).is_some_and(|r| r.status == "confirmed") {
                continue;
            }
            state.reservations.insert(
                key,
                LedgerReservation {
                    hold_token: hold_token.to_string(),
                    event_id: entry.event_id.clone(),
                    category_id: entry.category_id.clone(),
                    quantity: entry.quantity,
                    status: "confirmed".to_string(),
                    expires_at: Utc::now() + chrono::Duration::days(365),
                },
            );
            if let Some(category) = state
                .categories
                .get_mut(&(entry.event_id.clone(), entry.category_id.clone()))
            {
                category.available_quantity -= entry.quantity;
            }
            applied += 1;
        }
        Ok(LedgerConfirmation::Confirmed(applied))
    }

    async fn expire_pending_orders(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<ExpiredOrder>> {
        let mut state = self.state();
        Self::check_available(&state)?;

        let mut due: Vec<&mut LedgerOrder> = state
            .orders
            .values_mut()
            .filter(|o| o.status == "pending_payment" && o.expires_at < now)
            .collect();
        due.sort_by_key(|o| o.expires_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|order| {
                order.status = "cancelled".to_string();
                ExpiredOrder {
                    order_id: order.order_id.clone(),
                    hold_token: order.hold_token.clone(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_set_ranks_by_score_then_member() {
        let mut set = SortedSet::default();
        set.insert("c", 30);
        set.insert("a", 10);
        set.insert("b", 10);
        assert_eq!(set.rank("a"), Some(0));
        assert_eq!(set.rank("b"), Some(1));
        assert_eq!(set.rank("c"), Some(2));

        set.insert("a", 40);
        assert_eq!(set.rank("a"), Some(2));
        assert_eq!(set.up_to(30, 10), vec!["b".to_string(), "c".to_string()]);

        set.remove_below(35);
        assert_eq!(set.rank("a"), Some(0));
        assert!(set.rank("b").is_none());
    }

    #[tokio::test]
    async fn test_rate_window_slides() {
        let store = MemoryStore::new(Arc::new(crate::clock::SystemClock));
        for i in 0..3u64 {
            let d = store.record_hit("k", 3, 10, 100.0 + i as f64, "m").await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, 2 - i);
        }
        let denied = store.record_hit("k", 3, 10, 105.0, "m").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, 5);

        // Oldest hit (t=100) has left the window at t=110.
        let later = store.record_hit("k", 3, 10, 110.0, "m").await.unwrap();
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn test_ledger_confirm_is_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.upsert_category("evt-001", "cat-001-1", 10, 10);
        let entries = vec![HoldEntry {
            event_id: "evt-001".into(),
            category_id: "cat-001-1".into(),
            quantity: 2,
        }];

        assert_eq!(
            ledger.confirm_hold("tok", &entries).await.unwrap(),
            LedgerConfirmation::Confirmed(1)
        );
        assert_eq!(
            ledger.confirm_hold("tok", &entries).await.unwrap(),
            LedgerConfirmation::Confirmed(0)
        );
        assert_eq!(ledger.category("evt-001", "cat-001-1").unwrap().available_quantity, 8);
    }

    #[tokio::test]
    async fn test_ledger_confirm_and_expiry_exclude_each_other() {
        let ledger = MemoryLedger::new();
        ledger.upsert_category("evt-001", "cat-001-1", 10, 10);
        let entries = vec![HoldEntry {
            event_id: "evt-001".into(),
            category_id: "cat-001-1".into(),
            quantity: 1,
        }];
        let past = Utc::now() - chrono::Duration::minutes(1);
        for (order_id, token) in [("ord-paid", "tok-paid"), ("ord-late", "tok-late")] {
            ledger.add_order(LedgerOrder {
                order_id: order_id.into(),
                hold_token: Some(token.into()),
                status: "pending_payment".into(),
                expires_at: past,
            });
        }

        ledger.confirm_hold("tok-paid", &entries).await.unwrap();
        assert_eq!(ledger.order("ord-paid").unwrap().status, "paid");

        let expired = ledger.expire_pending_orders(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].order_id, "ord-late");

        assert_eq!(
            ledger.confirm_hold("tok-late", &entries).await.unwrap(),
            LedgerConfirmation::OrderCancelled
        );
        assert!(ledger.reservation("tok-late", "cat-001-1").is_none());
        assert_eq!(ledger.category("evt-001", "cat-001-1").unwrap().available_quantity, 9);
    }
}
