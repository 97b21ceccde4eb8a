//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rk_core::{Error, Result};
use rusqlite::Connection;

/// V1: initial schema -- libraries, items and their owned child rows, jobs.
const V1_INITIAL: &str = r#"
-- Libraries
CREATE TABLE libraries (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    root_path  TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Library items
CREATE TABLE items (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    library_id      INTEGER NOT NULL REFERENCES libraries(id) ON DELETE CASCADE,
    file_path       TEXT NOT NULL,
    title           TEXT NOT NULL,
    sort_title      TEXT NOT NULL,
    original_title  TEXT,
    year            INTEGER,
    runtime_minutes INTEGER,
    overview        TEXT,
    genres          TEXT NOT NULL DEFAULT '[]',
    match_status    TEXT NOT NULL DEFAULT 'unmatched',
    external_ids    TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (library_id, file_path)
);

-- Cast and crew, owned by an item
CREATE TABLE credits (
    id      INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    name    TEXT NOT NULL,
    role    TEXT NOT NULL,
    part    TEXT,
    ordinal INTEGER NOT NULL DEFAULT 0
);

-- Downloaded artwork
CREATE TABLE artwork (
    id           INTEGER PRIMARY KEY,
    item_id      INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    kind         TEXT NOT NULL,
    url          TEXT NOT NULL,
    local_path   TEXT,
    content_hash TEXT,
    width        INTEGER,
    height       INTEGER,
    provider     TEXT,
    created_at   TEXT NOT NULL
);

-- Downloaded subtitles
CREATE TABLE subtitles (
    id         INTEGER PRIMARY KEY,
    item_id    INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    language   TEXT NOT NULL,
    format     TEXT NOT NULL,
    url        TEXT NOT NULL,
    local_path TEXT,
    provider   TEXT,
    created_at TEXT NOT NULL
);

-- Audit trail of item mutations; survives item removal
CREATE TABLE history_events (
    id         INTEGER PRIMARY KEY,
    item_id    INTEGER REFERENCES items(id) ON DELETE SET NULL,
    job_id     TEXT,
    action     TEXT NOT NULL,
    detail     TEXT,
    created_at TEXT NOT NULL
);

-- Background jobs
CREATE TABLE jobs (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    target_id     INTEGER NOT NULL,
    payload       TEXT NOT NULL DEFAULT '{}',
    status        TEXT NOT NULL DEFAULT 'queued',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL,
    error         TEXT,
    result        TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    finished_at   TEXT
);

-- Pagination: one index per sort key, each ending in id for stable tiling
CREATE INDEX idx_items_library_title  ON items(library_id, sort_title, id);
CREATE INDEX idx_items_library_year   ON items(library_id, year, sort_title, id);
CREATE INDEX idx_items_library_added  ON items(library_id, created_at, id);
CREATE INDEX idx_items_library_status ON items(library_id, match_status);

CREATE INDEX idx_credits_item   ON credits(item_id, ordinal);
CREATE INDEX idx_artwork_item   ON artwork(item_id, kind);
CREATE INDEX idx_subtitles_item ON subtitles(item_id, language);
CREATE INDEX idx_history_item   ON history_events(item_id);

-- Deduplication: at most one active job per (kind, target)
CREATE INDEX idx_jobs_kind_target ON jobs(kind, target_id);
CREATE UNIQUE INDEX idx_jobs_active ON jobs(kind, target_id)
    WHERE status IN ('queued', 'running');
CREATE INDEX idx_jobs_status_finished ON jobs(status, finished_at);
"#;

/// V2: on-disk provider result cache.
const V2_CACHE_ENTRIES: &str = r#"
CREATE TABLE cache_entries (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    hit_count  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_cache_entries_expires ON cache_entries(expires_at);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_CACHE_ENTRIES)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        tracing::debug!(version, "Applied migration");
    }

    Ok(())
}
