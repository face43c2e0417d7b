//! Server-side Lua scripts.
//!
//! Each script runs atomically on the server, so a check and the write it
//! guards can never be split by another client.

/// Reap stale semaphore members, then admit `ARGV[2]` if there is room.
///
/// - `KEYS[1]`: sorted set
/// - `ARGV[1]`: max members
/// - `ARGV[2]`: member
/// - `ARGV[3]`: now (ms), used as the score
/// - `ARGV[4]`: stale threshold (ms)
///
/// Returns 1 if admitted, 0 if full.
pub const SEMAPHORE_ACQUIRE: &str = r"
local cutoff = tonumber(ARGV[3]) - tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)

local current = redis.call('ZCARD', KEYS[1])
if current < tonumber(ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[2])
  return 1
end
return 0
";

/// Increment a counter and make sure it expires.
///
/// - `KEYS[1]`: counter
/// - `ARGV[1]`: TTL (ms) applied on first increment or if the key has none
///
/// Returns the post-increment value.
pub const INCR_WITH_TTL: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 or redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

/// Raise a counter to at least `ARGV[1]` and refresh its TTL.
///
/// - `KEYS[1]`: counter
/// - `ARGV[1]`: ceiling
/// - `ARGV[2]`: TTL (ms)
///
/// Returns the resulting value.
pub const SATURATE_WITH_TTL: &str = r"
local value = tonumber(redis.call('GET', KEYS[1]) or '0')
local ceiling = tonumber(ARGV[1])
if value < ceiling then
  redis.call('SET', KEYS[1], ceiling)
  value = ceiling
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return value
";
