//! On-disk provider cache rows.
//!
//! All times are Unix milliseconds supplied by the caller's clock, so expiry
//! is decided by the same clock that computed `expires_at`.

use rk_core::Result;
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::CacheRow;

/// Read a live entry and count the hit in one statement. Expired rows are
/// treated as absent and left for the sweep.
pub fn get_live(conn: &Connection, key: &str, now_ms: i64) -> Result<Option<CacheRow>> {
    conn.query_row(
        "UPDATE cache_entries SET hit_count = hit_count + 1
         WHERE key = ?1 AND expires_at > ?2
         RETURNING key, value, created_at, expires_at, hit_count",
        rusqlite::params![key, now_ms],
        CacheRow::from_row,
    )
    .optional()
    .map_err(sql_err)
}

/// Insert or replace an entry, resetting its hit count.
pub fn upsert(
    conn: &Connection,
    key: &str,
    value: &[u8],
    now_ms: i64,
    expires_at_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cache_entries (key, value, created_at, expires_at, hit_count)
         VALUES (?1, ?2, ?3, ?4, 0)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at,
            hit_count = 0",
        rusqlite::params![key, value, now_ms, expires_at_ms],
    )
    .map_err(sql_err)?;
    Ok(())
}

/// Remove one entry regardless of expiry.
pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM cache_entries WHERE key = ?1", [key])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Remove every entry with `expires_at <= now_ms`.
pub fn delete_expired(conn: &Connection, now_ms: i64) -> Result<usize> {
    conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", [now_ms])
        .map_err(sql_err)
}

/// Number of physically stored rows, expired or not.
pub fn count(conn: &Connection) -> Result<u64> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
        .map_err(sql_err)?;
    Ok(n.max(0) as u64)
}
