//! Remote key-value cache backend (Redis).
//!
//! Each entry is a hash `{v, c, e, h}` holding the value, creation and
//! expiry times in Unix milliseconds, and the hit count. Expiry is judged
//! against our own clock by the read script; the server-side `PEXPIRE` only
//! reclaims memory for entries nobody sweeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::{RedisResult, Script};
use rk_core::{Clock, Error, Result};
use tokio::sync::Mutex;

use crate::{now_ms, ttl_ms, CacheHit, CacheStore};

const GET_SCRIPT: &str = r#"
local f = redis.call('HMGET', KEYS[1], 'v', 'c', 'e')
if not f[1] then
    return false
end
local expires = tonumber(f[3])
if expires == nil or expires <= tonumber(ARGV[1]) then
    return false
end
local hits = redis.call('HINCRBY', KEYS[1], 'h', 1)
return {f[1], tonumber(f[2]), expires, hits}
"#;

const SWEEP_SCRIPT: &str = r#"
local expires = tonumber(redis.call('HGET', KEYS[1], 'e'))
if expires ~= nil and expires <= tonumber(ARGV[1]) then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

const SCAN_BATCH: usize = 200;

pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
    op_timeout: Duration,
    clock: Arc<dyn Clock>,
    get_script: Script,
    sweep_script: Script,
}

impl RedisCache {
    /// Create a client for `address` (a `redis://` URL). No connection is
    /// made until the first operation.
    pub fn new(
        address: &str,
        key_prefix: String,
        op_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = redis::Client::open(address)
            .map_err(|e| Error::Validation(format!("invalid cache address {address}: {e}")))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            key_prefix,
            op_timeout,
            clock,
            get_script: Script::new(GET_SCRIPT),
            sweep_script: Script::new(SWEEP_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> RedisResult<MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one operation under the timeout, dropping the cached connection
    /// on any failure so the next call reconnects.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            f(conn).await
        };
        let failure = match tokio::time::timeout(self.op_timeout, attempt).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };

        self.conn.lock().await.take();
        tracing::warn!(op, error = %failure, "Remote cache operation failed");
        Err(Error::CacheUnavailable(format!("{op}: {failure}")))
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn backend(&self) -> &'static str {
        "remote_kv"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let key = self.full_key(key);
        let now = now_ms(self.clock.as_ref());
        let script = &self.get_script;
        let row: Option<(Vec<u8>, i64, i64, u64)> = self
            .run("get", |mut conn| async move {
                script.key(&key).arg(now).invoke_async(&mut conn).await
            })
            .await?;
        Ok(row.map(|(value, created, expires, hits)| {
            CacheHit::from_millis(Bytes::from(value), created, expires, hits)
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let key = self.full_key(key);
        let now = now_ms(self.clock.as_ref());
        let ttl = ttl_ms(ttl).max(1);
        let expires = now.saturating_add(ttl);
        self.run("set", |mut conn| async move {
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(&key)
                .ignore()
                .cmd("HSET")
                .arg(&key)
                .arg("v")
                .arg(value.as_ref())
                .arg("c")
                .arg(now)
                .arg("e")
                .arg(expires)
                .arg("h")
                .arg(0)
                .ignore()
                .cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn invalidate(&self, key: &str) -> Result<bool> {
        let key = self.full_key(key);
        let removed: i64 = self
            .run("invalidate", |mut conn| async move {
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn sweep(&self) -> Result<usize> {
        let pattern = format!("{}*", self.key_prefix);
        let now = now_ms(self.clock.as_ref());
        let script = &self.sweep_script;

        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let pattern = pattern.clone();
            let (next, keys): (u64, Vec<String>) = self
                .run("sweep", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            for key in keys {
                let n: i64 = self
                    .run("sweep", |mut conn| async move {
                        script.key(&key).arg(now).invoke_async(&mut conn).await
                    })
                    .await?;
                removed += n.max(0) as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}
