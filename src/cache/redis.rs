//! Redis-backed hot cache.
//!
//! Single-key reads and writes are one round trip; batch writes go through
//! a pipeline so the round-trip count stays flat regardless of batch size.
//! Timestamp monotonicity and the first-write throttle TTL are enforced
//! server-side with small Lua scripts.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::{coalesce_newest, location_key, throttle_key, LocationCache, CACHE_TTL};
use crate::models::Position;

/// Compare-and-set on the stored timestamp: a newer stored entry wins.
const PUT_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur then
  local ok, decoded = pcall(cjson.decode, cur)
  if ok and decoded['timestamp'] and tonumber(decoded['timestamp']) > tonumber(ARGV[2]) then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return 1
"#;

/// INCR with the window TTL applied only on the first write.
const THROTTLE_SCRIPT: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return n
"#;

pub struct RedisCache {
    conn: ConnectionManager,
    put_script: redis::Script,
    throttle_script: redis::Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("redis connection failed")?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;

        Ok(Self {
            conn,
            put_script: redis::Script::new(PUT_SCRIPT),
            throttle_script: redis::Script::new(THROTTLE_SCRIPT),
        })
    }

    fn ttl_ms() -> i64 {
        CACHE_TTL.as_millis() as i64
    }
}

#[async_trait]
impl LocationCache for RedisCache {
    async fn put(&self, pos: &Position) -> Result<()> {
        let payload = serde_json::to_string(pos)?;
        let mut conn = self.conn.clone();
        let _: i64 = self
            .put_script
            .key(location_key(&pos.vehicle_id))
            .arg(payload)
            .arg(pos.timestamp)
            .arg(Self::ttl_ms())
            .invoke_async(&mut conn)
            .await
            .context("cache put failed")?;
        Ok(())
    }

    async fn get(&self, vehicle_id: &str) -> Result<Option<Position>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(location_key(vehicle_id))
            .await
            .context("cache get failed")?;

        match raw {
            None => Ok(None),
            Some(json) => match serde_json::from_str(&json) {
                Ok(pos) => Ok(Some(pos)),
                Err(e) => {
                    warn!(vehicle_id, error = %e, "dropping unparsable cache entry");
                    Ok(None)
                }
            },
        }
    }

    async fn put_batch(&self, batch: &[Position]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // One pipelined round trip; each entry still goes through the
        // monotonicity script.
        let mut pipe = redis::pipe();
        for pos in coalesce_newest(batch) {
            let payload = serde_json::to_string(pos)?;
            pipe.cmd("EVAL")
                .arg(PUT_SCRIPT)
                .arg(1)
                .arg(location_key(&pos.vehicle_id))
                .arg(payload)
                .arg(pos.timestamp)
                .arg(Self::ttl_ms())
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("cache batch put failed")?;
        Ok(())
    }

    async fn incr_throttle(&self, vehicle_id: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = self
            .throttle_script
            .key(throttle_key(vehicle_id))
            .arg(window.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .context("throttle incr failed")?;
        Ok(n)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
