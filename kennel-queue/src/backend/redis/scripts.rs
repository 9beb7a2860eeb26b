//! Lua scripts that keep every lease transition atomic on the server.
//!
//! Job hashes live at `{prefix}:job:{id}`; scripts receive that prefix as
//! an argument because the job id is only known once a script runs.

/// KEYS: pending, job hash. ARGV: idempotency key or "", id, available_at ms,
/// job key prefix, then field/value pairs.
pub(super) const INSERT: &str = r#"
local idem = ARGV[1]
local id = ARGV[2]
if idem ~= '' then
  local existing = redis.call('GET', idem)
  if existing and redis.call('EXISTS', ARGV[4] .. existing) == 1 then
    return {existing, 0}
  end
  redis.call('SET', idem, id)
end
redis.call('HSET', KEYS[2], unpack(ARGV, 5))
redis.call('ZADD', KEYS[1], ARGV[3], id)
return {id, 1}
"#;

/// KEYS: pending, leased. ARGV: now ms, leased_until ms, token, worker id,
/// job key prefix.
pub(super) const CLAIM: &str = r#"
local now = tonumber(ARGV[1])
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
local lapsed = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
local id
if #ready > 0 and (#lapsed == 0 or tonumber(ready[2]) <= tonumber(lapsed[2])) then
  id = ready[1]
  redis.call('ZREM', KEYS[1], id)
elseif #lapsed > 0 then
  id = lapsed[1]
else
  return false
end
local key = ARGV[5] .. id
if redis.call('EXISTS', key) == 0 then
  redis.call('ZREM', KEYS[2], id)
  return false
end
redis.call('HINCRBY', key, 'attempts', 1)
redis.call('HSET', key, 'lease_token', ARGV[3], 'leased_until', ARGV[2], 'leased_by', ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[2], id)
return redis.call('HGETALL', key)
"#;

/// KEYS: leased, job hash. ARGV: token, id, idempotency key prefix.
pub(super) const COMPLETE: &str = r#"
if redis.call('HGET', KEYS[2], 'lease_token') ~= ARGV[1] then
  return false
end
local fields = redis.call('HGETALL', KEYS[2])
local name = redis.call('HGET', KEYS[2], 'name')
local idem = redis.call('HGET', KEYS[2], 'idempotency_key')
if idem and name and redis.call('GET', ARGV[3] .. name .. ':' .. idem) == ARGV[2] then
  redis.call('DEL', ARGV[3] .. name .. ':' .. idem)
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', KEYS[2])
return fields
"#;

/// KEYS: leased, pending, job hash. ARGV: token, id, available_at ms, error.
pub(super) const RELEASE: &str = r#"
if redis.call('HGET', KEYS[3], 'lease_token') ~= ARGV[1] then
  return false
end
redis.call('HDEL', KEYS[3], 'lease_token', 'leased_until', 'leased_by')
redis.call('HSET', KEYS[3], 'available_at', ARGV[3], 'last_error', ARGV[4])
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return redis.call('HGETALL', KEYS[3])
"#;

/// KEYS: leased, dlq, job hash. ARGV: token, id, buried_at ms, error.
pub(super) const BURY: &str = r#"
if redis.call('HGET', KEYS[3], 'lease_token') ~= ARGV[1] then
  return false
end
redis.call('HDEL', KEYS[3], 'lease_token', 'leased_until', 'leased_by')
redis.call('HSET', KEYS[3], 'dead_lettered_at', ARGV[3], 'last_error', ARGV[4])
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return redis.call('HGETALL', KEYS[3])
"#;

/// KEYS: leased, job hash. ARGV: token, id, leased_until ms.
pub(super) const EXTEND: &str = r#"
if redis.call('HGET', KEYS[2], 'lease_token') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[2], 'leased_until', ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[2])
return 1
"#;

/// KEYS: dlq, pending, job hash. ARGV: id, available_at ms.
pub(super) const REVIVE: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return false
end
local attempts = tonumber(redis.call('HGET', KEYS[3], 'attempts') or '0')
local budget = tonumber(redis.call('HGET', KEYS[3], 'attempt_budget') or '1')
redis.call('HDEL', KEYS[3], 'dead_lettered_at')
redis.call('HSET', KEYS[3], 'max_attempts', attempts + budget, 'available_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return redis.call('HGETALL', KEYS[3])
"#;
