//! Lua sources for the atomic inventory scripts.
//!
//! Every script is a single atomic unit on the store. Replies share one
//! shape: `{1, ...}` on success, `{0, code, detail}` on a precondition
//! failure, so the Rust side can parse them uniformly.

/// KEYS: zone availability, user tally, reservation hash.
/// ARGV: quantity, max_per_user, user_id, booking_id, zone_id, event_id,
///       show_id, unit_price, ttl_seconds, now_epoch_ms.
///
/// Precondition order is fixed: quantity, zone presence, stock, user cap.
/// A reservation hash that already exists for this booking id means a
/// retried request: current counters are returned and nothing is deducted.
pub const RESERVE: &str = r#"
local qty = tonumber(ARGV[1])
if not qty or qty <= 0 then
  return {0, 'VALIDATION_ERROR', 'quantity must be positive'}
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {0, 'ZONE_NOT_FOUND', 'zone availability not initialized'}
end
local tally = tonumber(redis.call('GET', KEYS[2]) or '0')
if redis.call('EXISTS', KEYS[3]) == 1 then
  local avail = tonumber(redis.call('GET', KEYS[1]))
  return {1, avail, tally, 'ALREADY_RESERVED'}
end
local avail = tonumber(redis.call('GET', KEYS[1]))
if avail < qty then
  return {0, 'INSUFFICIENT_STOCK', tostring(avail)}
end
local cap = tonumber(ARGV[2])
if cap > 0 and tally + qty > cap then
  return {0, 'USER_LIMIT_EXCEEDED', tostring(tally)}
end
local ttl = tonumber(ARGV[9])
local now_ms = tonumber(ARGV[10])
local remaining = redis.call('DECRBY', KEYS[1], qty)
local new_tally = redis.call('INCRBY', KEYS[2], qty)
redis.call('EXPIRE', KEYS[2], ttl + 60)
redis.call('HSET', KEYS[3],
  'booking_id', ARGV[4],
  'user_id', ARGV[3],
  'zone_id', ARGV[5],
  'event_id', ARGV[6],
  'show_id', ARGV[7],
  'quantity', ARGV[1],
  'unit_price', ARGV[8],
  'status', 'reserved',
  'created_at', ARGV[10],
  'expires_at', tostring(now_ms + ttl * 1000))
redis.call('EXPIRE', KEYS[3], ttl)
return {1, remaining, new_tally, 'RESERVED'}
"#;

/// KEYS: zone availability, user tally, reservation hash, tombstone.
/// ARGV: booking_id, user_id, mode ('' or 'allow_confirmed').
///
/// A tombstone distinguishes "already released" from "never existed or
/// expired" once the hash itself is gone. `allow_confirmed` is reserved for
/// saga compensation, the only caller permitted to undo a confirmed
/// reservation.
pub const RELEASE: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 0 then
  if redis.call('EXISTS', KEYS[4]) == 1 then
    return {0, 'ALREADY_RELEASED', ''}
  end
  return {0, 'RESERVATION_NOT_FOUND', 'missing or expired'}
end
local r = redis.call('HMGET', KEYS[3], 'booking_id', 'user_id', 'status', 'quantity')
if r[1] ~= ARGV[1] then
  return {0, 'RESERVATION_NOT_FOUND', 'booking mismatch'}
end
if r[2] ~= ARGV[2] then
  return {0, 'OWNER_MISMATCH', 'user mismatch'}
end
if r[3] == 'confirmed' and ARGV[3] ~= 'allow_confirmed' then
  return {0, 'ALREADY_CONFIRMED', ''}
end
if r[3] ~= 'reserved' and r[3] ~= 'confirmed' then
  return {0, 'ALREADY_RELEASED', ''}
end
local qty = tonumber(r[4])
local avail = redis.call('INCRBY', KEYS[1], qty)
local tally = redis.call('DECRBY', KEYS[2], qty)
if tally <= 0 then
  redis.call('DEL', KEYS[2])
  tally = 0
end
redis.call('DEL', KEYS[3])
redis.call('SET', KEYS[4], 'released', 'EX', 3600)
return {1, avail, tally}
"#;

/// KEYS: reservation hash.
/// ARGV: booking_id, user_id, payment_id, now_epoch_ms.
pub const CONFIRM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {0, 'RESERVATION_NOT_FOUND', 'missing or expired'}
end
local r = redis.call('HMGET', KEYS[1], 'booking_id', 'user_id', 'status', 'confirmed_at')
if r[1] ~= ARGV[1] then
  return {0, 'RESERVATION_NOT_FOUND', 'booking mismatch'}
end
if r[2] ~= ARGV[2] then
  return {0, 'OWNER_MISMATCH', 'user mismatch'}
end
if r[3] == 'confirmed' then
  return {0, 'ALREADY_CONFIRMED', r[4] or ''}
end
redis.call('HSET', KEYS[1],
  'status', 'confirmed',
  'confirmed_at', ARGV[4],
  'payment_id', ARGV[3])
redis.call('PERSIST', KEYS[1])
return {1, 'CONFIRMED', ARGV[4]}
"#;

/// KEYS: zone availability, user tally, reservation hash, tombstone.
/// ARGV: booking_id, quantity.
///
/// Expiry-worker variant of release. When the hash is gone (its TTL fired)
/// availability is restored from the caller's quantity, guarded by a SET NX
/// tombstone so concurrent or re-run scans cannot double-credit the zone.
pub const RELEASE_EXPIRED: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
  local r = redis.call('HMGET', KEYS[3], 'booking_id', 'status', 'quantity')
  if r[1] ~= ARGV[1] then
    return {0, 'RESERVATION_NOT_FOUND', 'booking mismatch'}
  end
  if r[2] == 'confirmed' then
    return {0, 'ALREADY_CONFIRMED', ''}
  end
  local qty = tonumber(r[3])
  local avail = redis.call('INCRBY', KEYS[1], qty)
  local tally = redis.call('DECRBY', KEYS[2], qty)
  if tally <= 0 then
    redis.call('DEL', KEYS[2])
  end
  redis.call('DEL', KEYS[3])
  redis.call('SET', KEYS[4], 'expired', 'EX', 3600)
  return {1, 'RELEASED', avail}
end
if redis.call('SET', KEYS[4], 'expired', 'NX', 'EX', 3600) then
  local avail = redis.call('INCRBY', KEYS[1], tonumber(ARGV[2]))
  return {1, 'RESTORED', avail}
end
return {1, 'ALREADY_RESTORED', tonumber(redis.call('GET', KEYS[1]) or '0')}
"#;

/// KEYS: queue zset, queue user hash, active events set.
/// ARGV: user_id, event_id, now_epoch_ms, meta_ttl_seconds, max_queue_size.
///
/// The zset score is the join timestamp; equal scores order members
/// lexicographically, which is the documented user-id tie-break.
pub const JOIN_QUEUE: &str = r#"
local existing = redis.call('ZSCORE', KEYS[1], ARGV[1])
if existing then
  local pos = redis.call('ZRANK', KEYS[1], ARGV[1])
  return {0, 'ALREADY_IN_QUEUE', pos + 1, redis.call('ZCARD', KEYS[1])}
end
local size = redis.call('ZCARD', KEYS[1])
local max = tonumber(ARGV[5])
if max > 0 and size >= max then
  return {0, 'QUEUE_FULL', size, size}
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[3]), ARGV[1])
redis.call('HSET', KEYS[2], 'user_id', ARGV[1], 'event_id', ARGV[2], 'joined_at', ARGV[3])
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[4]))
redis.call('SADD', KEYS[3], ARGV[2])
local pos = redis.call('ZRANK', KEYS[1], ARGV[1])
return {1, 'JOINED', pos + 1, size + 1}
"#;

/// KEYS: pass key, pass index zset.
/// ARGV: user_id (index member), token, ttl_seconds, expires_epoch_ms.
pub const PUT_PASS: &str = r#"
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
redis.call('ZADD', KEYS[2], tonumber(ARGV[4]), ARGV[1])
return 1
"#;

/// KEYS: pass key, pass index zset.
/// ARGV: user_id (index member).
///
/// Single-use consumption: fetch and delete in one unit.
pub const TAKE_PASS: &str = r#"
local token = redis.call('GET', KEYS[1])
if not token then
  redis.call('ZREM', KEYS[2], ARGV[1])
  return false
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return token
"#;

/// KEYS: pass index zset.
/// ARGV: now_epoch_ms.
///
/// Prunes expired entries, then counts what is still live.
pub const COUNT_ACTIVE_PASSES: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
return redis.call('ZCARD', KEYS[1])
"#;
