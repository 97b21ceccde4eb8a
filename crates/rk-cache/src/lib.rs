//! rk-cache: provider result cache with TTL and hit accounting.
//!
//! [`CacheStore`] is the backend-neutral contract. Three backends implement
//! it: [`MemoryCache`] (in-process, capacity bounded), [`DiskCache`] (SQLite
//! `cache_entries` table, durable across restarts) and [`RedisCache`]
//! (remote key-value service). Exactly one backend is active at a time,
//! chosen by [`build_cache`] from configuration.
//!
//! Every backend treats an entry with `expires_at <= now` as absent.
//! Durable backends report an unreachable store as
//! [`Error::CacheUnavailable`](rk_core::Error::CacheUnavailable), never as a
//! miss.

pub mod disk;
pub mod fingerprint;
pub mod memory;
pub mod remote;
pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use rk_core::config::{CacheBackend, CacheConfig, DatabaseConfig};
use rk_core::{Clock, Error, Result};
use rk_db::DbPool;

pub use disk::DiskCache;
pub use fingerprint::{fingerprint, QueryParams};
pub use memory::MemoryCache;
pub use remote::RedisCache;
pub use sweeper::spawn_sweeper;

/// A live cache entry as returned by [`CacheStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Reads of this entry since it was last set, including this one.
    pub hit_count: u64,
}

impl CacheHit {
    fn from_millis(value: Bytes, created_at_ms: i64, expires_at_ms: i64, hit_count: u64) -> Self {
        Self {
            value,
            created_at: from_ms(created_at_ms),
            expires_at: from_ms(expires_at_ms),
            hit_count,
        }
    }
}

/// Key/value store with TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Read a live entry, counting the hit. Absent and expired keys are
    /// `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<CacheHit>>;

    /// Store `value` under `key`, replacing any existing entry, resetting its
    /// hit count and setting `expires_at = now + ttl`. A zero `ttl` stores
    /// nothing.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove `key`, returning whether an entry was present.
    async fn invalidate(&self, key: &str) -> Result<bool>;

    /// Remove every entry with `expires_at <= now`, returning how many were
    /// removed. Safe to call repeatedly.
    async fn sweep(&self) -> Result<usize>;
}

/// Build the configured backend.
///
/// The on-disk backend shares `db` unless `config.path` names a separate
/// database file.
pub fn build_cache(
    config: &CacheConfig,
    db: &DbPool,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match config.backend {
        CacheBackend::InProcess => Arc::new(MemoryCache::new(config.capacity, clock)),
        CacheBackend::OnDisk => {
            let pool = match &config.path {
                Some(path) => rk_db::init_pool(&DatabaseConfig {
                    path: path.clone(),
                    pool_size: 4,
                    busy_timeout_ms: config.op_timeout_ms,
                })?,
                None => db.clone(),
            };
            Arc::new(DiskCache::new(pool, clock, config.op_timeout()))
        }
        CacheBackend::RemoteKv => {
            let address = config.address.as_deref().ok_or_else(|| {
                Error::Validation("cache.address is required for the remote_kv backend".into())
            })?;
            Arc::new(RedisCache::new(
                address,
                config.key_prefix.clone(),
                config.op_timeout(),
                clock,
            )?)
        }
    };

    tracing::info!(backend = store.backend(), "Cache backend ready");
    Ok(store)
}

pub(crate) fn now_ms(clock: &dyn Clock) -> i64 {
    clock.now().timestamp_millis()
}

pub(crate) fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::SystemClock;

    #[test]
    fn build_in_process_by_default() {
        let pool = rk_db::init_memory_pool().unwrap();
        let store = build_cache(&CacheConfig::default(), &pool, Arc::new(SystemClock)).unwrap();
        assert_eq!(store.backend(), "in_process");
    }

    #[test]
    fn build_on_disk_shares_library_db() {
        let pool = rk_db::init_memory_pool().unwrap();
        let config = CacheConfig {
            backend: CacheBackend::OnDisk,
            ..Default::default()
        };
        let store = build_cache(&config, &pool, Arc::new(SystemClock)).unwrap();
        assert_eq!(store.backend(), "on_disk");
    }

    #[test]
    fn remote_without_address_is_rejected() {
        let pool = rk_db::init_memory_pool().unwrap();
        let config = CacheConfig {
            backend: CacheBackend::RemoteKv,
            address: None,
            ..Default::default()
        };
        assert!(matches!(
            build_cache(&config, &pool, Arc::new(SystemClock)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn millis_roundtrip() {
        let t = from_ms(1_700_000_000_123);
        assert_eq!(t.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2_000);
    }
}
