//! Lua sources for every multi-key transition. Each script runs atomically
//! on the server, which is what keeps counters and hold records consistent
//! under concurrent traffic.
//!
//! Scripts that need to report a business outcome return a JSON object
//! `{ok, error?, categoryId?, available?, status?, entries?}`.

use redis::Script;

/// KEYS: hold, expiry index, indexed entries.
/// ARGV: prefix, token, entries json, createdAt, expiresAt, expiresAtEpoch,
/// key ttl, traceId, metadata json.
///
/// Quantities are summed per counter while checking so a repeated category
/// cannot pass the availability check twice.
pub const ACQUIRE_HOLD: &str = r#"
local holdKey = KEYS[1]
local indexKey = KEYS[2]
local prefix = ARGV[1]

if redis.call('EXISTS', holdKey) == 1 then
  return cjson.encode({ok = false, error = 'HOLD_ALREADY_EXISTS'})
end

local entries = cjson.decode(ARGV[3])
local wanted = {}
for _, entry in ipairs(entries) do
  local qty = tonumber(entry.quantity)
  if qty == nil or qty <= 0 then
    return cjson.encode({ok = false, error = 'INVALID_QUANTITY', categoryId = entry.categoryId})
  end
  local key = prefix .. 'inventory:' .. entry.eventId .. ':' .. entry.categoryId
  wanted[key] = (wanted[key] or 0) + qty
  local available = tonumber(redis.call('HGET', key, 'available') or '0')
  if available < wanted[key] then
    return cjson.encode({ok = false, error = 'INSUFFICIENT_STOCK', categoryId = entry.categoryId, available = available})
  end
end

for _, entry in ipairs(entries) do
  local key = prefix .. 'inventory:' .. entry.eventId .. ':' .. entry.categoryId
  local qty = tonumber(entry.quantity)
  redis.call('HINCRBY', key, 'available', -qty)
  redis.call('HINCRBY', key, 'pending', qty)
  redis.call('HINCRBY', key, 'version', 1)
end

redis.call('HSET', holdKey,
  'token', ARGV[2],
  'status', 'held',
  'entries', ARGV[3],
  'createdAt', ARGV[4],
  'expiresAt', ARGV[5],
  'expiresAtEpoch', ARGV[6],
  'traceId', ARGV[8],
  'metadata', ARGV[9])
redis.call('EXPIRE', holdKey, tonumber(ARGV[7]))
redis.call('ZADD', indexKey, tonumber(ARGV[6]), ARGV[2])
redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])

return cjson.encode({ok = true})
"#;

/// KEYS: hold, expiry index, indexed entries. ARGV: token, claimed ttl.
pub const CLAIM_HOLD: &str = r#"
local holdKey = KEYS[1]
if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok = false, error = 'HOLD_NOT_FOUND'})
end
if redis.call('HGET', holdKey, 'token') ~= ARGV[1] then
  return cjson.encode({ok = false, error = 'INVALID_TOKEN'})
end
local status = redis.call('HGET', holdKey, 'status')
if status ~= 'held' then
  return cjson.encode({ok = false, error = 'HOLD_NOT_ACTIVE', status = status})
end

redis.call('HSET', holdKey, 'status', 'claimed')
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('EXPIRE', holdKey, tonumber(ARGV[2]))

return cjson.encode({ok = true, entries = redis.call('HGET', holdKey, 'entries')})
"#;

/// KEYS: hold, expiry index, indexed entries. ARGV: prefix, token.
pub const RELEASE_HOLD: &str = r#"
local holdKey = KEYS[1]
local prefix = ARGV[1]
if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok = false, error = 'HOLD_NOT_FOUND'})
end
local status = redis.call('HGET', holdKey, 'status')
if status ~= 'held' and status ~= 'claimed' then
  return cjson.encode({ok = true, released = false, status = status})
end

local entries = cjson.decode(redis.call('HGET', holdKey, 'entries'))
for _, entry in ipairs(entries) do
  local key = prefix .. 'inventory:' .. entry.eventId .. ':' .. entry.categoryId
  local qty = tonumber(entry.quantity)
  redis.call('HINCRBY', key, 'available', qty)
  redis.call('HINCRBY', key, 'pending', -qty)
  redis.call('HINCRBY', key, 'version', 1)
end

redis.call('DEL', holdKey)
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[3], ARGV[2])
return cjson.encode({ok = true, released = true})
"#;

/// KEYS: hold, expiry index, indexed entries. ARGV: prefix, token.
pub const FINALIZE_HOLD: &str = r#"
local holdKey = KEYS[1]
local prefix = ARGV[1]
if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok = false, error = 'HOLD_NOT_FOUND'})
end
local status = redis.call('HGET', holdKey, 'status')
if status ~= 'claimed' then
  return cjson.encode({ok = false, error = 'HOLD_NOT_CLAIMED', status = status})
end

local entries = cjson.decode(redis.call('HGET', holdKey, 'entries'))
for _, entry in ipairs(entries) do
  local key = prefix .. 'inventory:' .. entry.eventId .. ':' .. entry.categoryId
  local qty = tonumber(entry.quantity)
  redis.call('HINCRBY', key, 'pending', -qty)
  redis.call('HINCRBY', key, 'sold', qty)
  redis.call('HINCRBY', key, 'version', 1)
end

redis.call('DEL', holdKey)
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('HDEL', KEYS[3], ARGV[2])
return cjson.encode({ok = true})
"#;

/// KEYS: hold, expiry index. ARGV: token, expiresAt, expiresAtEpoch, key ttl.
/// A missing hold is never recreated. Only a held hold is touched, so a claimed
/// hold keeps its checkout TTL.
pub const EXTEND_HOLD: &str = r#"
local holdKey = KEYS[1]
if redis.call('EXISTS', holdKey) == 0 then
  return cjson.encode({ok = false, error = 'HOLD_NOT_FOUND'})
end
local status = redis.call('HGET', holdKey, 'status')
if status ~= 'held' then
  return cjson.encode({ok = false, error = 'HOLD_NOT_ACTIVE', status = status})
end
redis.call('HSET', holdKey, 'expiresAt', ARGV[2], 'expiresAtEpoch', ARGV[3])
redis.call('EXPIRE', holdKey, tonumber(ARGV[4]))
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), ARGV[1])
return cjson.encode({ok = true})
"#;

/// KEYS: expiry index, indexed entries. ARGV: prefix, now epoch, batch limit.
///
/// Entries are read from the indexed-entries hash, which has no TTL, so stock
/// comes back even when the hold record was evicted before this pass.
pub const CLEANUP_EXPIRED: &str = r#"
local indexKey = KEYS[1]
local entriesKey = KEYS[2]
local prefix = ARGV[1]
local expired = redis.call('ZRANGEBYSCORE', indexKey, '-inf', ARGV[2], 'LIMIT', 0, tonumber(ARGV[3]))

for _, token in ipairs(expired) do
  local holdKey = prefix .. 'holds:' .. token
  local raw = redis.call('HGET', entriesKey, token)
  if not raw then
    raw = redis.call('HGET', holdKey, 'entries')
  end
  if raw then
    for _, entry in ipairs(cjson.decode(raw)) do
      local key = prefix .. 'inventory:' .. entry.eventId .. ':' .. entry.categoryId
      local qty = tonumber(entry.quantity)
      redis.call('HINCRBY', key, 'available', qty)
      redis.call('HINCRBY', key, 'pending', -qty)
      redis.call('HINCRBY', key, 'version', 1)
    end
  end
  redis.call('DEL', holdKey)
  redis.call('ZREM', indexKey, token)
  redis.call('HDEL', entriesKey, token)
end

return #expired
"#;

/// KEYS: inventory. ARGV: total, sold, reserved. Returns the new available.
/// `available` is recomputed from the live `pending`, never from `reserved`.
pub const SYNC_INVENTORY: &str = r#"
local key = KEYS[1]
local total = tonumber(ARGV[1])
local sold = tonumber(ARGV[2])
local pending = tonumber(redis.call('HGET', key, 'pending') or '0')
local available = total - sold - pending
if available < 0 then
  available = 0
end
redis.call('HSET', key, 'total', total, 'sold', sold, 'reserved', tonumber(ARGV[3]), 'available', available, 'pending', pending)
redis.call('HINCRBY', key, 'version', 1)
return available
"#;

/// KEYS: inventory. ARGV: total, sold, pending, available, reserved.
pub const POPULATE_INVENTORY: &str = r#"
local key = KEYS[1]
if redis.call('EXISTS', key) == 1 then
  return 0
end
redis.call('HSET', key,
  'total', ARGV[1],
  'sold', ARGV[2],
  'pending', ARGV[3],
  'available', ARGV[4],
  'reserved', ARGV[5],
  'version', 1)
return 1
"#;

/// KEYS: ordering set, details. ARGV: queueId, score, details json, ttl, prune before.
/// Returns the 0-based rank.
pub const ENQUEUE: &str = r#"
redis.call('SET', KEYS[2], ARGV[3], 'EX', tonumber(ARGV[4]))
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[5])
redis.call('ZADD', KEYS[1], tonumber(ARGV[2]), ARGV[1])
return redis.call('ZRANK', KEYS[1], ARGV[1])
"#;

/// KEYS: window set. ARGV: limit, window seconds, now, member.
/// Returns `{allowed, remaining, retryAfter}`.
pub const RATE_LIMIT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('EXPIRE', key, window)
  return {1, limit - count - 1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retryAfter = 0
if oldest and oldest[2] then
  retryAfter = math.ceil(tonumber(oldest[2]) + window - now)
end
if retryAfter < 0 then
  retryAfter = 0
end
return {0, 0, retryAfter}
"#;

/// Compiled once per client so the SHA is computed a single time.
pub struct Scripts {
    pub acquire: Script,
    pub claim: Script,
    pub release: Script,
    pub finalize: Script,
    pub extend: Script,
    pub cleanup: Script,
    pub sync: Script,
    pub populate: Script,
    pub enqueue: Script,
    pub rate_limit: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            acquire: Script::new(ACQUIRE_HOLD),
            claim: Script::new(CLAIM_HOLD),
            release: Script::new(RELEASE_HOLD),
            finalize: Script::new(FINALIZE_HOLD),
            extend: Script::new(EXTEND_HOLD),
            cleanup: Script::new(CLEANUP_EXPIRED),
            sync: Script::new(SYNC_INVENTORY),
            populate: Script::new(POPULATE_INVENTORY),
            enqueue: Script::new(ENQUEUE),
            rate_limit: Script::new(RATE_LIMIT),
        }
    }
}
