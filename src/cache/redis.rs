//! Redis-backed [`SharedCache`] (requires the `redis-cache` feature).

use super::SharedCache;
use crate::error::CacheError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use std::time::Duration;

/// `INCR` and set the expiry in one step, so a crash between the two
/// cannot leave a counter that never expires.
const INCR_WITH_EXPIRY_LUA: &str = r"
local n = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return n
";

static INCR_WITH_EXPIRY: LazyLock<Script> = LazyLock::new(|| Script::new(INCR_WITH_EXPIRY_LUA));

/// `SADD`, applying the expiry only when the set has none. An empty TTL
/// argument leaves the set persistent.
const SADD_WITH_EXPIRY_LUA: &str = r"
local added = redis.call('SADD', KEYS[1], ARGV[1])
if ARGV[2] ~= '' and redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return added
";

static SADD_WITH_EXPIRY: LazyLock<Script> = LazyLock::new(|| Script::new(SADD_WITH_EXPIRY_LUA));

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

pub struct RedisSharedCache {
    conn: MultiplexedConnection,
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

impl RedisSharedCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(unavailable)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(unavailable)
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get_del(key).await.map_err(unavailable)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let next: i64 = INCR_WITH_EXPIRY
            .key(key)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        u64::try_from(next).map_err(|_| CacheError::WrongType(key.to_string()))
    }

    async fn sadd(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let ttl_arg = ttl.map(|t| ttl_ms(t).to_string()).unwrap_or_default();
        let added: i64 = SADD_WITH_EXPIRY
            .key(key)
            .arg(member)
            .arg(ttl_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(added == 1)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        conn.sismember(key, member).await.map_err(unavailable)
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(unavailable)
    }

    async fn record_in_window(
        &self,
        key: &str,
        timestamp_ms: i64,
        window: Duration,
    ) -> Result<Vec<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let cutoff = timestamp_ms - window.as_millis() as i64;
        // Members must be unique even when timestamps collide.
        let member = format!("{}:{:08x}", timestamp_ms, rand::random::<u32>());

        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .zadd(key, &member, timestamp_ms)
            .ignore()
            .zrembyscore(key, "-inf", format!("({}", cutoff))
            .ignore()
            .pexpire(key, window.as_millis() as i64)
            .ignore()
            .zrangebyscore(key, cutoff, "+inf")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(members
            .iter()
            .filter_map(|m| m.split(':').next()?.parse::<i64>().ok())
            .collect())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_ms_never_zero() {
        assert_eq!(ttl_ms(Duration::ZERO), 1);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_scripts_expire_in_the_same_call() {
        assert!(INCR_WITH_EXPIRY_LUA.contains("'INCR'"));
        assert!(INCR_WITH_EXPIRY_LUA.contains("'PEXPIRE'"));
        assert!(SADD_WITH_EXPIRY_LUA.contains("'SADD'"));
        assert!(SADD_WITH_EXPIRY_LUA.contains("'PEXPIRE'"));
    }

    /// Needs a live server: `REDIS_URL=redis://127.0.0.1/ cargo test --features redis-cache -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_counter_and_set_carry_expiry() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let cache = RedisSharedCache::connect(&url).await.unwrap();
        let key = format!("paycrawl:test:{:08x}", rand::random::<u32>());
        let set_key = format!("{key}:set");

        assert_eq!(cache.incr_with_expiry(&key, Duration::from_secs(30)).await.unwrap(), 1);
        assert_eq!(cache.incr_with_expiry(&key, Duration::from_secs(30)).await.unwrap(), 2);
        assert!(cache.sadd(&set_key, "a", Some(Duration::from_secs(30))).await.unwrap());
        assert!(!cache.sadd(&set_key, "a", Some(Duration::from_secs(30))).await.unwrap());

        let mut conn = cache.conn.clone();
        let counter_ttl: i64 = conn.pttl(&key).await.unwrap();
        let set_ttl: i64 = conn.pttl(&set_key).await.unwrap();
        assert!(counter_ttl > 0 && counter_ttl <= 30_000);
        assert!(set_ttl > 0 && set_ttl <= 30_000);

        assert!(cache.set_nx_ex(&key, "x", Duration::from_secs(30)).await.is_ok_and(|w| !w));
        cache.del(&key).await.unwrap();
        cache.del(&set_key).await.unwrap();
    }
}
