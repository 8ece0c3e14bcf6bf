//! Redis live score store.
//!
//! Enable with the `redis` feature flag:
//! ```toml
//! kaos-rank = { version = "0.1", features = ["redis"] }
//! ```
//!
//! Each board lives under three keys sharing one hash tag, so a cluster keeps
//! them on one slot:
//!
//! - `kaosrank:{id}:meta`: hash with `mode`, `frozen` and the tie-breaker `seq`
//! - `kaosrank:{id}:entries`: hash of `user -> "points:tie_breaker"`
//! - `kaosrank:{id}:rank`: sorted set scored by points
//!
//! Sorted-set members are `"{MAX - tie_breaker:016}:{user}"` (see [`member`]).
//! `ZREVRANGE` orders equal scores by member descending, which is tie-breaker
//! ascending. Every mutation is a Lua script and runs atomically on the server.
//!
//! A load writes its chunks into expiring staging keys under the same hash
//! tag, then one script swaps them in with `RENAME`. Upserts never see a
//! partly loaded board.
//!
//! Scores are stored as doubles, so points must stay within ±2^53.

use super::LiveScoreStore;
use crate::entry::{LiveEntry, PointMode, ScoreUpdate};
use crate::error::{RankError, Result};
use async_trait::async_trait;
use deadpool_redis::redis::{self, Script};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use uuid::Uuid;

const STATUS_OK: i64 = 0;
const STATUS_NOT_FOUND: i64 = -1;
const STATUS_FROZEN: i64 = -2;
const STATUS_NO_ENTRY: i64 = -3;

const LOAD_CHUNK: usize = 500;
/// Staging keys outlive an abandoned load by this long.
const STAGING_TTL_MS: i64 = 10 * 60 * 1000;

/// Largest tie-breaker a member can encode; also the largest integer a Lua
/// double holds exactly.
const MAX_TIE_BREAKER: i64 = 9_007_199_254_740_991;
/// Width of the encoded tie-breaker plus the `:` separator.
const MEMBER_PREFIX_LEN: usize = 17;

/// Sorted-set member for a user. Must match the Lua scripts below.
fn member(tie_breaker: i64, user_id: &str) -> String {
    format!("{:016}:{}", MAX_TIE_BREAKER - tie_breaker, user_id)
}

/// User id carried by a sorted-set member.
fn member_user(member: &str) -> Option<&str> {
    member.get(MEMBER_PREFIX_LEN..)
}

const UPSERT: &str = r#"
local max_tb = 9007199254740991
local mode = redis.call('HGET', KEYS[1], 'mode')
if not mode then return {-1} end
if redis.call('HGET', KEYS[1], 'frozen') == '1' then return {-2} end
local user = ARGV[1]
local value = tonumber(ARGV[2])
local points = value
local current = redis.call('HGET', KEYS[2], user)
if current then
  local sep = string.find(current, ':', 1, true)
  local cur_points = tonumber(string.sub(current, 1, sep - 1))
  local cur_tb = tonumber(string.sub(current, sep + 1))
  if mode == 'cumulative' then
    points = cur_points + value
  else
    points = math.max(cur_points, value)
  end
  if points == cur_points then return {0, cur_points, cur_tb, 0} end
  redis.call('ZREM', KEYS[3], string.format('%016d:%s', max_tb - cur_tb, user))
end
local tb = redis.call('HINCRBY', KEYS[1], 'seq', 1)
redis.call('HSET', KEYS[2], user, string.format('%d:%d', points, tb))
redis.call('ZADD', KEYS[3], points, string.format('%016d:%s', max_tb - tb, user))
return {0, points, tb, 1}
"#;

const RANK: &str = r#"
local max_tb = 9007199254740991
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local current = redis.call('HGET', KEYS[2], ARGV[1])
if not current then return -3 end
local sep = string.find(current, ':', 1, true)
local tb = tonumber(string.sub(current, sep + 1))
local rank = redis.call('ZREVRANK', KEYS[3], string.format('%016d:%s', max_tb - tb, ARGV[1]))
if not rank then return -3 end
return rank + 1
"#;

const TOP: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
local out = {}
local members = redis.call('ZREVRANGE', KEYS[3], 0, tonumber(ARGV[1]))
for _, member in ipairs(members) do
  local user = string.sub(member, 18)
  local current = redis.call('HGET', KEYS[2], user)
  if current then
    local sep = string.find(current, ':', 1, true)
    table.insert(out, member)
    table.insert(out, string.sub(current, 1, sep - 1))
    table.insert(out, string.sub(current, sep + 1))
  end
end
return out
"#;

const OPEN: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'mode', ARGV[1], 'frozen', '0', 'seq', '0')
return 1
"#;

const FREEZE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('HSET', KEYS[1], 'frozen', '1')
return 0
"#;

// KEYS: staging meta, entries, rank. ARGV: ttl_ms, then (user, points, tb, member)*.
const LOAD_STAGE: &str = r#"
local seq = tonumber(redis.call('HGET', KEYS[1], 'seq') or '0')
for i = 2, #ARGV, 4 do
  local tb = tonumber(ARGV[i + 2])
  redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1] .. ':' .. ARGV[i + 2])
  redis.call('ZADD', KEYS[3], tonumber(ARGV[i + 1]), ARGV[i + 3])
  if tb > seq then seq = tb end
end
redis.call('HSET', KEYS[1], 'seq', string.format('%d', seq))
for i = 1, 3 do redis.call('PEXPIRE', KEYS[i], ARGV[1]) end
return 0
"#;

// KEYS: live meta, entries, rank, then staging meta, entries, rank.
// ARGV: mode, frozen, last tie-breaker.
const LOAD_COMMIT: &str = r#"
local seq = tonumber(ARGV[3])
local staged = redis.call('HGET', KEYS[4], 'seq')
if staged and tonumber(staged) > seq then seq = tonumber(staged) end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4])
for i = 2, 3 do
  if redis.call('EXISTS', KEYS[i + 3]) == 1 then
    redis.call('RENAME', KEYS[i + 3], KEYS[i])
    redis.call('PERSIST', KEYS[i])
  end
end
redis.call('HSET', KEYS[1], 'mode', ARGV[1], 'frozen', ARGV[2], 'seq', string.format('%d', seq))
return 0
"#;

/// Live boards held in Redis.
pub struct RedisLiveStore {
    pool: Pool,
    upsert: Script,
    rank: Script,
    top: Script,
    open: Script,
    freeze: Script,
    load_stage: Script,
    load_commit: Script,
}

fn live_err(e: impl std::fmt::Display) -> RankError {
    RankError::LiveStore(e.to_string())
}

struct Keys {
    meta: String,
    entries: String,
    rank: String,
}

impl Keys {
    fn new(leaderboard_id: &str) -> Self {
        Self {
            meta: format!("kaosrank:{{{}}}:meta", leaderboard_id),
            entries: format!("kaosrank:{{{}}}:entries", leaderboard_id),
            rank: format!("kaosrank:{{{}}}:rank", leaderboard_id),
        }
    }

    /// Keys for one load attempt, on the same slot as the live board.
    fn staging(leaderboard_id: &str, token: &str) -> Self {
        Self {
            meta: format!("kaosrank:{{{}}}:load:{}:meta", leaderboard_id, token),
            entries: format!("kaosrank:{{{}}}:load:{}:entries", leaderboard_id, token),
            rank: format!("kaosrank:{{{}}}:load:{}:rank", leaderboard_id, token),
        }
    }
}

impl RedisLiveStore {
    /// Connect with a Redis URL.
    pub fn new(redis_url: &str) -> Result<Self> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(live_err)?;
        Ok(Self::with_pool(pool))
    }

    /// Create with an existing pool.
    pub fn with_pool(pool: Pool) -> Self {
        Self {
            pool,
            upsert: Script::new(UPSERT),
            rank: Script::new(RANK),
            top: Script::new(TOP),
            open: Script::new(OPEN),
            freeze: Script::new(FREEZE),
            load_stage: Script::new(LOAD_STAGE),
            load_commit: Script::new(LOAD_COMMIT),
        }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(live_err)
    }

    async fn top(&self, leaderboard_id: &str, last_index: i64) -> Result<Vec<LiveEntry>> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let flat: Option<Vec<String>> = self
            .top
            .key(&keys.meta)
            .key(&keys.entries)
            .key(&keys.rank)
            .arg(last_index)
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;
        let flat = flat.ok_or_else(|| RankError::not_found(leaderboard_id))?;

        flat.chunks_exact(3)
            .map(|row| {
                let user_id = member_user(&row[0])
                    .ok_or_else(|| RankError::LiveStore(format!("malformed member: {}", row[0])))?;
                let points = row[1].parse::<i64>().map_err(live_err)?;
                let tie_breaker = row[2].parse::<i64>().map_err(live_err)?;
                Ok(LiveEntry::new(user_id, points, tie_breaker))
            })
            .collect()
    }
}

#[async_trait]
impl LiveScoreStore for RedisLiveStore {
    async fn open(&self, leaderboard_id: &str, mode: PointMode) -> Result<bool> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let created: i64 = self
            .open
            .key(&keys.meta)
            .arg(mode.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;
        Ok(created == 1)
    }

    async fn upsert(&self, leaderboard_id: &str, user_id: &str, value: i64) -> Result<ScoreUpdate> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let reply: Vec<i64> = self
            .upsert
            .key(&keys.meta)
            .key(&keys.entries)
            .key(&keys.rank)
            .arg(user_id)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;

        match reply.as_slice() {
            [STATUS_OK, points, tie_breaker, changed] => Ok(ScoreUpdate {
                points: *points,
                tie_breaker: *tie_breaker,
                changed: *changed == 1,
            }),
            [STATUS_NOT_FOUND] => Err(RankError::not_found(leaderboard_id)),
            [STATUS_FROZEN] => Err(RankError::frozen(leaderboard_id)),
            other => Err(RankError::LiveStore(format!(
                "unexpected upsert reply: {:?}",
                other
            ))),
        }
    }

    async fn rank_of(&self, leaderboard_id: &str, user_id: &str) -> Result<u64> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let rank: i64 = self
            .rank
            .key(&keys.meta)
            .key(&keys.entries)
            .key(&keys.rank)
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;
        match rank {
            STATUS_NOT_FOUND => Err(RankError::not_found(leaderboard_id)),
            STATUS_NO_ENTRY => Err(RankError::entry_not_found(leaderboard_id, user_id)),
            rank => Ok(rank as u64),
        }
    }

    async fn top_n(&self, leaderboard_id: &str, n: usize) -> Result<Vec<LiveEntry>> {
        if n == 0 {
            // Still report a missing board.
            self.is_frozen(leaderboard_id).await?;
            return Ok(Vec::new());
        }
        self.top(leaderboard_id, n as i64 - 1).await
    }

    async fn entries(&self, leaderboard_id: &str) -> Result<Vec<LiveEntry>> {
        self.top(leaderboard_id, -1).await
    }

    async fn freeze(&self, leaderboard_id: &str) -> Result<()> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let status: i64 = self
            .freeze
            .key(&keys.meta)
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;
        if status == STATUS_NOT_FOUND {
            return Err(RankError::not_found(leaderboard_id));
        }
        Ok(())
    }

    async fn is_frozen(&self, leaderboard_id: &str) -> Result<bool> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.meta)
            .arg("mode")
            .arg("frozen")
            .query_async(&mut conn)
            .await
            .map_err(live_err)?;
        match fields.as_slice() {
            [Some(_), frozen] => Ok(frozen.as_deref() == Some("1")),
            _ => Err(RankError::not_found(leaderboard_id)),
        }
    }

    async fn evict(&self, leaderboard_id: &str) -> Result<bool> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(&keys.meta)
            .arg(&keys.entries)
            .arg(&keys.rank)
            .query_async(&mut conn)
            .await
            .map_err(live_err)?;
        Ok(removed > 0)
    }

    async fn load(
        &self,
        leaderboard_id: &str,
        mode: PointMode,
        entries: Vec<LiveEntry>,
        last_tie_breaker: i64,
        frozen: bool,
    ) -> Result<()> {
        let keys = Keys::new(leaderboard_id);
        let staging = Keys::staging(leaderboard_id, &Uuid::new_v4().simple().to_string());
        let mut conn = self.conn().await?;

        for chunk in entries.chunks(LOAD_CHUNK) {
            let mut invocation = self.load_stage.prepare_invoke();
            invocation
                .key(&staging.meta)
                .key(&staging.entries)
                .key(&staging.rank)
                .arg(STAGING_TTL_MS);
            for entry in chunk {
                invocation
                    .arg(&entry.user_id)
                    .arg(entry.points)
                    .arg(entry.tie_breaker)
                    .arg(member(entry.tie_breaker, &entry.user_id));
            }
            let _: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(live_err)?;
        }

        let _: i64 = self
            .load_commit
            .key(&keys.meta)
            .key(&keys.entries)
            .key(&keys.rank)
            .key(&staging.meta)
            .key(&staging.entries)
            .key(&staging.rank)
            .arg(mode.as_str())
            .arg(if frozen { "1" } else { "0" })
            .arg(last_tie_breaker.max(0))
            .invoke_async(&mut conn)
            .await
            .map_err(live_err)?;
        Ok(())
    }

    async fn contains(&self, leaderboard_id: &str) -> Result<bool> {
        let keys = Keys::new(leaderboard_id);
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(&keys.meta)
            .query_async(&mut conn)
            .await
            .map_err(live_err)?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_hash_tag() {
        let keys = Keys::new("weekly-42");
        assert_eq!(keys.meta, "kaosrank:{weekly-42}:meta");
        assert_eq!(keys.entries, "kaosrank:{weekly-42}:entries");
        assert_eq!(keys.rank, "kaosrank:{weekly-42}:rank");

        let staging = Keys::staging("weekly-42", "abc");
        assert_eq!(staging.meta, "kaosrank:{weekly-42}:load:abc:meta");
        assert_eq!(staging.entries, "kaosrank:{weekly-42}:load:abc:entries");
        assert_eq!(staging.rank, "kaosrank:{weekly-42}:load:abc:rank");
    }

    #[test]
    fn test_member_orders_by_tie_breaker() {
        let earlier = member(3, "zed");
        let later = member(4, "amy");
        // ZREVRANGE walks members descending: the earlier tie-breaker first.
        assert!(earlier > later);

        let mut members: Vec<String> = [(12, "c"), (1, "a"), (1_000_000, "d"), (7, "b")]
            .iter()
            .map(|(tb, user)| member(*tb, user))
            .collect();
        members.sort_by(|a, b| b.cmp(a));
        let users: Vec<_> = members.iter().filter_map(|m| member_user(m)).collect();
        assert_eq!(users, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_member_carries_user_after_fixed_prefix() {
        assert_eq!(member(1, "a:b"), "9007199254740990:a:b");
        assert_eq!(member(MAX_TIE_BREAKER, "u"), "0000000000000000:u");
        assert_eq!(member(42, "user-7").len(), MEMBER_PREFIX_LEN + "user-7".len());
        assert_eq!(member_user(&member(42, "user-7")), Some("user-7"));
        assert_eq!(member_user("short"), None);
    }
}
