use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::info;
use turnstile_core::repository::{
    AcquireCommand, CounterStore, ExtendCommand, HoldGrant, HoldStore, QueueStore, RateDecision, RateLimitStore,
    ReleaseOutcome,
};
use turnstile_core::{CoreError, CoreResult, NotFoundKind, Rejection};
use turnstile_shared::{HoldEntry, HoldMetadata, HoldRecord, HoldStatus, InventoryCounter, QueueEntry};

use crate::keys::KeySpace;
use crate::scripts::Scripts;

fn store_err(e: impl Display) -> CoreError {
    CoreError::StoreError(e.to_string())
}

/// Outcome object returned by the hold scripts.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    category_id: Option<String>,
    #[serde(default)]
    available: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    released: Option<bool>,
    /// Raw JSON as stored in the hold hash.
    #[serde(default)]
    entries: Option<String>,
}

impl ScriptReply {
    fn parse(raw: &str) -> CoreResult<Self> {
        serde_json::from_str(raw).map_err(store_err)
    }

    fn status(&self) -> CoreResult<HoldStatus> {
        self.status
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(CoreError::StoreError)
    }

    /// Maps a failed reply onto the error taxonomy.
    fn into_error(self) -> CoreError {
        match self.error.as_deref() {
            Some("HOLD_NOT_FOUND") => NotFoundKind::Hold.into(),
            Some("HOLD_ALREADY_EXISTS") => Rejection::HoldAlreadyExists.into(),
            Some("INVALID_TOKEN") => Rejection::InvalidToken.into(),
            Some("INVALID_QUANTITY") => Rejection::InvalidQuantity {
                category_id: self.category_id.unwrap_or_default(),
            }
            .into(),
            Some("INSUFFICIENT_STOCK") => Rejection::InsufficientStock {
                category_id: self.category_id.unwrap_or_default(),
                available: self.available.unwrap_or(0),
            }
            .into(),
            Some("HOLD_NOT_ACTIVE") => match self.status() {
                Ok(status) => Rejection::HoldNotActive { status }.into(),
                Err(e) => e,
            },
            Some("HOLD_NOT_CLAIMED") => match self.status() {
                Ok(status) => Rejection::HoldNotClaimed { status }.into(),
                Err(e) => e,
            },
            other => CoreError::StoreError(format!("unexpected script reply: {:?}", other)),
        }
    }
}

fn field<'a>(hash: &'a HashMap<String, String>, name: &str) -> &'a str {
    hash.get(name).map(String::as_str).unwrap_or_default()
}

fn int_field(hash: &HashMap<String, String>, name: &str) -> i64 {
    field(hash, name).parse().unwrap_or(0)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_counter(event_id: &str, category_id: &str, hash: &HashMap<String, String>) -> InventoryCounter {
    InventoryCounter {
        event_id: event_id.to_string(),
        category_id: category_id.to_string(),
        total: int_field(hash, "total"),
        sold: int_field(hash, "sold"),
        pending: int_field(hash, "pending"),
        available: int_field(hash, "available"),
        reserved: int_field(hash, "reserved"),
        version: int_field(hash, "version"),
    }
}

fn parse_timestamp(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(store_err)
}

fn parse_hold(hash: &HashMap<String, String>) -> CoreResult<HoldRecord> {
    let entries: Vec<HoldEntry> = serde_json::from_str(field(hash, "entries")).map_err(store_err)?;
    let metadata: HoldMetadata = match field(hash, "metadata") {
        "" => HoldMetadata::default(),
        raw => serde_json::from_str(raw).map_err(store_err)?,
    };
    Ok(HoldRecord {
        token: field(hash, "token").to_string(),
        status: field(hash, "status").parse().map_err(CoreError::StoreError)?,
        entries,
        created_at: parse_timestamp(field(hash, "createdAt"))?,
        expires_at: parse_timestamp(field(hash, "expiresAt"))?,
        expires_at_epoch: int_field(hash, "expiresAtEpoch"),
        trace_id: non_empty(field(hash, "traceId")),
        metadata,
    })
}

/// Fast-store adapter. One multiplexed connection is shared by the whole
/// process; the manager reconnects transparently after errors.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
    keys: KeySpace,
    scripts: Arc<Scripts>,
}

impl RedisClient {
    pub async fn new(connection_string: &str, key_prefix: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis (key prefix {:?})", key_prefix);
        Ok(Self {
            conn,
            keys: KeySpace::new(key_prefix),
            scripts: Arc::new(Scripts::load()),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(store_err)
    }
}

#[async_trait]
impl CounterStore for RedisClient {
    async fn counter(&self, event_id: &str, category_id: &str) -> CoreResult<Option<InventoryCounter>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn
            .hgetall(self.keys.inventory(event_id, category_id))
            .await
            .map_err(store_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_counter(event_id, category_id, &hash)))
    }

    async fn seed(&self, counter: &InventoryCounter) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.inventory(&counter.event_id, &counter.category_id);
        let fields = [
            ("total", counter.total),
            ("sold", counter.sold),
            ("pending", counter.pending),
            ("available", counter.available),
            ("reserved", counter.reserved),
            ("version", counter.version),
        ];
        conn.hset_multiple::<_, _, _, ()>(key, &fields)
            .await
            .map_err(store_err)
    }

    async fn populate_if_absent(&self, counter: &InventoryCounter) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .scripts
            .populate
            .key(self.keys.inventory(&counter.event_id, &counter.category_id))
            .arg(counter.total)
            .arg(counter.sold)
            .arg(counter.pending)
            .arg(counter.available)
            .arg(counter.reserved)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(written == 1)
    }

    async fn sync(
        &self,
        event_id: &str,
        category_id: &str,
        total: i64,
        sold: i64,
        reserved: i64,
    ) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        self.scripts
            .sync
            .key(self.keys.inventory(event_id, category_id))
            .arg(total)
            .arg(sold)
            .arg(reserved)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl HoldStore for RedisClient {
    async fn acquire(&self, cmd: &AcquireCommand) -> CoreResult<HoldGrant> {
        let mut conn = self.conn.clone();
        let entries = serde_json::to_string(&cmd.entries).map_err(store_err)?;
        let metadata = serde_json::to_string(&cmd.metadata).map_err(store_err)?;

        let raw: String = self
            .scripts
            .acquire
            .key(self.keys.hold(&cmd.hold_token))
            .key(self.keys.expiry_index())
            .key(self.keys.indexed_entries())
            .arg(self.keys.prefix())
            .arg(&cmd.hold_token)
            .arg(entries)
            .arg(cmd.created_at.to_rfc3339())
            .arg(cmd.expires_at.to_rfc3339())
            .arg(cmd.expires_at_epoch())
            .arg(cmd.key_ttl_seconds)
            .arg(cmd.trace_id.as_deref().unwrap_or_default())
            .arg(metadata)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let reply = ScriptReply::parse(&raw)?;
        if !reply.ok {
            return Err(reply.into_error());
        }
        Ok(HoldGrant {
            hold_token: cmd.hold_token.clone(),
            expires_at: cmd.expires_at,
            expires_at_epoch: cmd.expires_at_epoch(),
        })
    }

    async fn claim(&self, hold_token: &str, claimed_ttl_seconds: u64) -> CoreResult<Vec<HoldEntry>> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .claim
            .key(self.keys.hold(hold_token))
            .key(self.keys.expiry_index())
            .key(self.keys.indexed_entries())
            .arg(hold_token)
            .arg(claimed_ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let reply = ScriptReply::parse(&raw)?;
        if !reply.ok {
            return Err(reply.into_error());
        }
        serde_json::from_str(reply.entries.as_deref().unwrap_or("[]")).map_err(store_err)
    }

    async fn release(&self, hold_token: &str) -> CoreResult<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .release
            .key(self.keys.hold(hold_token))
            .key(self.keys.expiry_index())
            .key(self.keys.indexed_entries())
            .arg(self.keys.prefix())
            .arg(hold_token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let reply = ScriptReply::parse(&raw)?;
        if !reply.ok {
            return Err(reply.into_error());
        }
        if reply.released == Some(false) {
            return Ok(ReleaseOutcome::AlreadyTerminal(reply.status()?));
        }
        Ok(ReleaseOutcome::Released)
    }

    async fn finalize(&self, hold_token: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .finalize
            .key(self.keys.hold(hold_token))
            .key(self.keys.expiry_index())
            .key(self.keys.indexed_entries())
            .arg(self.keys.prefix())
            .arg(hold_token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let reply = ScriptReply::parse(&raw)?;
        if !reply.ok {
            return Err(reply.into_error());
        }
        Ok(())
    }

    async fn extend(&self, cmd: &ExtendCommand) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .extend
            .key(self.keys.hold(&cmd.hold_token))
            .key(self.keys.expiry_index())
            .arg(&cmd.hold_token)
            .arg(cmd.expires_at.to_rfc3339())
            .arg(cmd.expires_at.timestamp())
            .arg(cmd.key_ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let reply = ScriptReply::parse(&raw)?;
        if reply.ok {
            return Ok(true);
        }
        match reply.into_error() {
            CoreError::NotFound(NotFoundKind::Hold) => Ok(false),
            e => Err(e),
        }
    }

    async fn hold(&self, hold_token: &str) -> CoreResult<Option<HoldRecord>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn.hgetall(self.keys.hold(hold_token)).await.map_err(store_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        parse_hold(&hash).map(Some)
    }

    async fn sweep_expired(&self, now_epoch: i64, limit: usize) -> CoreResult<usize> {
        let mut conn = self.conn.clone();
        self.scripts
            .cleanup
            .key(self.keys.expiry_index())
            .key(self.keys.indexed_entries())
            .arg(self.keys.prefix())
            .arg(now_epoch)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl QueueStore for RedisClient {
    async fn enqueue(&self, entry: &QueueEntry, ttl_seconds: u64, prune_before_ms: i64) -> CoreResult<u64> {
        let mut conn = self.conn.clone();
        let details = serde_json::to_string(entry).map_err(store_err)?;
        self.scripts
            .enqueue
            .key(self.keys.queue(&entry.event_id))
            .key(self.keys.queue_entry(&entry.queue_id))
            .arg(&entry.queue_id)
            .arg(entry.enqueued_at_ms)
            .arg(details)
            .arg(ttl_seconds)
            .arg(prune_before_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn entry(&self, queue_id: &str) -> CoreResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.queue_entry(queue_id)).await.map_err(store_err)?;
        raw.map(|r| serde_json::from_str(&r).map_err(store_err)).transpose()
    }

    async fn rank(&self, event_id: &str, queue_id: &str) -> CoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANK")
            .arg(self.keys.queue(event_id))
            .arg(queue_id)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn remove(&self, event_id: &str, queue_id: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let (deleted, removed): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.keys.queue_entry(queue_id))
            .zrem(self.keys.queue(event_id), queue_id)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted + removed > 0)
    }
}

#[async_trait]
impl RateLimitStore for RedisClient {
    async fn record_hit(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        now: f64,
        member: &str,
    ) -> CoreResult<RateDecision> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, retry_after): (i64, i64, i64) = self
            .scripts
            .rate_limit
            .key(self.keys.rate_limit(key))
            .arg(limit)
            .arg(window_seconds)
            .arg(now)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            retry_after_seconds: retry_after.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_maps_to_rejections() {
        let reply = ScriptReply::parse(r#"{"ok":false,"error":"INSUFFICIENT_STOCK","categoryId":"cat-001-2","available":3}"#)
            .unwrap();
        match reply.into_error() {
            CoreError::Rejected(Rejection::InsufficientStock { category_id, available }) => {
                assert_eq!(category_id, "cat-001-2");
                assert_eq!(available, 3);
            }
            other => panic!("unexpected: {other}"),
        }

        let reply = ScriptReply::parse(r#"{"ok":false,"error":"HOLD_NOT_ACTIVE","status":"claimed"}"#).unwrap();
        assert!(matches!(
            reply.into_error(),
            CoreError::Rejected(Rejection::HoldNotActive {
                status: HoldStatus::Claimed
            })
        ));

        let reply = ScriptReply::parse(r#"{"ok":false,"error":"HOLD_NOT_FOUND"}"#).unwrap();
        assert!(matches!(reply.into_error(), CoreError::NotFound(NotFoundKind::Hold)));
    }

    #[test]
    fn test_parse_hold_hash() {
        let hash: HashMap<String, String> = [
            ("token", "tok-1"),
            ("status", "claimed"),
            ("entries", r#"[{"eventId":"evt-001","categoryId":"cat-001-1","quantity":2}]"#),
            ("createdAt", "2026-01-01T10:00:00+00:00"),
            ("expiresAt", "2026-01-01T10:10:00+00:00"),
            ("expiresAtEpoch", "1767262200"),
            ("traceId", ""),
            ("metadata", r#"{"requesterId":"user-1"}"#),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let hold = parse_hold(&hash).unwrap();
        assert_eq!(hold.status, HoldStatus::Claimed);
        assert_eq!(hold.entries[0].quantity, 2);
        assert_eq!(hold.expires_at_epoch, 1767262200);
        assert!(hold.trace_id.is_none());
        assert_eq!(hold.metadata.requester_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_missing_counter_fields_read_as_zero() {
        let hash: HashMap<String, String> = [("total".to_string(), "10".to_string())].into_iter().collect();
        let counter = parse_counter("evt-001", "cat-001-1", &hash);
        assert_eq!((counter.total, counter.available, counter.version), (10, 0, 0));
    }
}
