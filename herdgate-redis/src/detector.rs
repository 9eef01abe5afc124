use async_trait::async_trait;
use herdgate::{BackendError, ConfigError, Detector, Fingerprint, TokenBucketConfig};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::Script;
use tracing::debug;

use crate::{RedisBackendError, RedisKeys, Scope};

// KEYS[1]: bucket hash
// ARGV[1]: max tokens (burst)
// ARGV[2]: refill rate, tokens per second
// Returns 1 when allowed, 0 for a thundering herd.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local time = redis.call("TIME")
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local bucket = redis.call("HMGET", key, "tokens", "last_refreshed")
local tokens = tonumber(bucket[1]) or max_tokens
local last_refreshed = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refreshed)
local available = math.min(max_tokens, tokens + (elapsed * refill_rate))
local ttl = math.max(1, math.ceil(max_tokens / refill_rate))

if available >= 1 then
  redis.call("HSET", key, "tokens", available - 1, "last_refreshed", now)
  redis.call("EXPIRE", key, ttl)
  return 1
end

redis.call("HSET", key, "tokens", 0, "last_refreshed", now)
redis.call("EXPIRE", key, ttl)
return 0
"#;

/// Token bucket detector whose state lives in Redis, shared by every process using
/// the same keys.
///
/// The refill-and-consume step runs server-side as one script, so concurrent callers
/// across the fleet never race on a bucket. Cooldowns are `SET ... PX` keys.
#[derive(Clone)]
pub struct TokenBucketRedis<C = ConnectionManager> {
    conn: C,
    config: TokenBucketConfig,
    keys: RedisKeys,
    script: Script,
}

impl<C> std::fmt::Debug for TokenBucketRedis<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketRedis")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .field("conn", &"<redis connection>")
            .finish()
    }
}

impl<C> TokenBucketRedis<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Create a detector using an existing connection.
    pub fn new(conn: C, config: TokenBucketConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            conn,
            config: config.validate()?,
            keys: RedisKeys::default(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Use a custom key namespace.
    pub fn with_keys(mut self, keys: RedisKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }
}

#[async_trait]
impl<C> Detector for TokenBucketRedis<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn cool_down(&self, fingerprint: &Fingerprint) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(self.config.cooldown_interval().as_millis()).unwrap_or(u64::MAX);
        let reply: String = redis::cmd("SET")
            .arg(self.keys.key(Scope::CoolDown, fingerprint))
            .arg(1)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("SET"))?;
        if reply != "OK" {
            return Err(RedisBackendError::UnexpectedReply { command: "SET", reply }.into());
        }
        Ok(())
    }

    async fn is_cool_down(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.keys.key(Scope::CoolDown, fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("EXISTS"))?;
        Ok(found == 1)
    }

    async fn is_thundering_herd(&self, fingerprint: &Fingerprint) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(self.keys.key(Scope::ThunderingHerd, fingerprint))
            .arg(self.config.limiters_burst())
            .arg(self.config.refill_rate_per_sec())
            .invoke_async(&mut conn)
            .await
            .map_err(RedisBackendError::command("EVALSHA"))?;
        if allowed == 0 {
            debug!(target: "herdgate_redis::detector", fingerprint = %fingerprint, "bucket empty");
        }
        Ok(allowed == 0)
    }
}
