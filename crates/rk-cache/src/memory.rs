//! In-process cache backend.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rk_core::{Clock, Result};

use crate::{now_ms, ttl_ms, CacheHit, CacheStore};

struct Entry {
    value: Bytes,
    created_at_ms: i64,
    expires_at_ms: i64,
    hits: AtomicU64,
}

/// Capacity-bounded map with TTL, living for the lifetime of the process.
///
/// When a new key would exceed `capacity`, the entries closest to expiry are
/// evicted, expired ones first. Reads only touch the map; every write holds
/// the `expiry` index lock, which lists each stored key by expiry time.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    expiry: Mutex<BTreeSet<(i64, String)>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            expiry: Mutex::new(BTreeSet::new()),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_expired(&self, expiry: &mut BTreeSet<(i64, String)>, now: i64) -> usize {
        let mut removed = 0;
        while let Some((expires_at, _)) = expiry.first() {
            if *expires_at > now {
                break;
            }
            if let Some((_, key)) = expiry.pop_first() {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn evict_one(&self, expiry: &mut BTreeSet<(i64, String)>) -> bool {
        match expiry.pop_first() {
            Some((_, key)) => {
                self.entries.remove(&key);
                tracing::trace!(%key, "Evicted cache entry");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn backend(&self) -> &'static str {
        "in_process"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>> {
        let now = now_ms(self.clock.as_ref());
        let expired_at = match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => {
                let hits = entry.hits.fetch_add(1, Ordering::Relaxed) + 1;
                return Ok(Some(CacheHit::from_millis(
                    entry.value.clone(),
                    entry.created_at_ms,
                    entry.expires_at_ms,
                    hits,
                )));
            }
            Some(entry) => entry.expires_at_ms,
            None => return Ok(None),
        };

        // The map guard is released before taking the index lock.
        let mut expiry = self.expiry.lock();
        if self
            .entries
            .remove_if(key, |_, e| e.expires_at_ms <= now)
            .is_some()
        {
            expiry.remove(&(expired_at, key.to_string()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let now = now_ms(self.clock.as_ref());
        let expires_at_ms = now.saturating_add(ttl_ms(ttl));

        let mut expiry = self.expiry.lock();
        let previous = self.entries.get(key).map(|e| e.expires_at_ms);
        match previous {
            Some(old) => {
                expiry.remove(&(old, key.to_string()));
            }
            None if self.entries.len() >= self.capacity => {
                let expired = self.remove_expired(&mut expiry, now);
                if expired > 0 {
                    tracing::debug!(expired, "Dropped expired cache entries to make room");
                }
                while self.entries.len() >= self.capacity && self.evict_one(&mut expiry) {}
            }
            None => {}
        }

        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at_ms: now,
                expires_at_ms,
                hits: AtomicU64::new(0),
            },
        );
        expiry.insert((expires_at_ms, key.to_string()));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<bool> {
        let mut expiry = self.expiry.lock();
        match self.entries.remove(key) {
            Some((key, entry)) => {
                expiry.remove(&(entry.expires_at_ms, key));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sweep(&self) -> Result<usize> {
        let now = now_ms(self.clock.as_ref());
        let mut expiry = self.expiry.lock();
        Ok(self.remove_expired(&mut expiry, now))
    }
}
