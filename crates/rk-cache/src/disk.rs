//! On-disk cache backend over the SQLite `cache_entries` table.
//!
//! Entries survive process restarts. Every operation borrows a pooled
//! connection on the blocking thread pool and is bounded by the configured
//! operation timeout; any failure to reach the database surfaces as
//! `CacheUnavailable`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rk_core::{Clock, Error, Result};
use rk_db::queries::cache_entries;
use rk_db::{DbPool, PooledConnection};

use crate::{now_ms, ttl_ms, CacheHit, CacheStore};

pub struct DiskCache {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    op_timeout: Duration,
}

impl DiskCache {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, op_timeout: Duration) -> Self {
        Self {
            pool,
            clock,
            op_timeout,
        }
    }

    /// Number of stored rows, expired or not.
    pub async fn len(&self) -> Result<u64> {
        self.with_conn("count", |conn| cache_entries::count(conn)).await
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PooledConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let timeout = self.op_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let conn = pool
                .get_timeout(timeout)
                .map_err(|e| Error::CacheUnavailable(format!("no connection: {e}")))?;
            f(&conn)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(unavailable(op, e)),
            Ok(Err(join)) => Err(Error::CacheUnavailable(format!("{op}: {join}"))),
            Err(_) => Err(Error::CacheUnavailable(format!("{op}: timed out"))),
        }
    }
}

fn unavailable(op: &str, e: Error) -> Error {
    match e {
        Error::CacheUnavailable(_) => e,
        other => {
            tracing::warn!(op, error = %other, "On-disk cache operation failed");
            Error::CacheUnavailable(format!("{op}: {other}"))
        }
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    fn backend(&self) -> &'static str {
        "on_disk"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let key = key.to_string();
        let now = now_ms(self.clock.as_ref());
        let row = self
            .with_conn("get", move |conn| cache_entries::get_live(conn, &key, now))
            .await?;
        Ok(row.map(|r| {
            CacheHit::from_millis(Bytes::from(r.value), r.created_at_ms, r.expires_at_ms, r.hit_count)
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let key = key.to_string();
        let now = now_ms(self.clock.as_ref());
        let expires = now.saturating_add(ttl_ms(ttl));
        self.with_conn("set", move |conn| {
            cache_entries::upsert(conn, &key, &value, now, expires)
        })
        .await
    }

    async fn invalidate(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn("invalidate", move |conn| cache_entries::delete(conn, &key))
            .await
    }

    async fn sweep(&self) -> Result<usize> {
        let now = now_ms(self.clock.as_ref());
        self.with_conn("sweep", move |conn| cache_entries::delete_expired(conn, now))
            .await
    }
}
