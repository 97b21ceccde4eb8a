//! Persisted job mirror.
//!
//! The in-memory queue is authoritative while the process runs; these rows
//! let jobs survive a restart and back the one-active-job-per-target rule
//! with a partial unique index.

use rk_core::{JobId, JobStatus, Result};
use rusqlite::Connection;

use crate::error::sql_err;
use crate::models::JobRecord;

const COLS: &str = "id, kind, target_id, payload, status, attempt_count, max_attempts,
    error, result, created_at, updated_at, finished_at";

/// Insert a freshly submitted job.
pub fn insert_job(conn: &Connection, job: &JobRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, kind, target_id, payload, status, attempt_count, max_attempts,
            error, result, created_at, updated_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            job.id.to_string(),
            job.kind.as_str(),
            job.target.raw_id(),
            job.payload,
            job.status.as_str(),
            job.attempt_count,
            job.max_attempts,
            job.error,
            job.result,
            job.created_at,
            job.updated_at,
            job.finished_at,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<JobRecord>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    let result = conn.query_row(&q, [id.to_string()], JobRecord::from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(sql_err(e)),
    }
}

/// Record a state transition. Timestamps are taken from `job` as is, so
/// retention is measured on the same clock that stamped them.
pub fn update_job_status(conn: &Connection, job: &JobRecord) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET status=?1, attempt_count=?2, error=?3,
                result=COALESCE(?4, result), updated_at=?5, finished_at=?6
             WHERE id=?7",
            rusqlite::params![
                job.status.as_str(),
                job.attempt_count,
                job.error,
                job.result,
                job.updated_at,
                job.finished_at,
                job.id.to_string(),
            ],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Cancel a job row only while it is still `queued`. Returns whether it was.
pub fn cancel_queued(conn: &Connection, id: JobId, reason: &str, at: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET status='cancelled', error=?1, updated_at=?2, finished_at=?2
             WHERE id=?3 AND status='queued'",
            rusqlite::params![reason, at, id.to_string()],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// List jobs, newest first, optionally filtered by status.
pub fn list_jobs(conn: &Connection, status: Option<JobStatus>, limit: i64) -> Result<Vec<JobRecord>> {
    let rows = match status {
        Some(s) => {
            let q = format!(
                "SELECT {COLS} FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&q).map_err(sql_err)?;
            let rows = stmt
                .query_map(rusqlite::params![s.as_str(), limit], JobRecord::from_row)
                .map_err(sql_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows
        }
        None => {
            let q = format!("SELECT {COLS} FROM jobs ORDER BY created_at DESC LIMIT ?1");
            let mut stmt = conn.prepare(&q).map_err(sql_err)?;
            let rows = stmt
                .query_map([limit], JobRecord::from_row)
                .map_err(sql_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows
        }
    };
    Ok(rows)
}

/// Jobs left `queued` or `running` by a previous process, oldest first.
pub fn list_unfinished(conn: &Connection) -> Result<Vec<JobRecord>> {
    let q = format!(
        "SELECT {COLS} FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([], JobRecord::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}

/// Delete terminal jobs that finished before `cutoff` (RFC 3339).
pub fn delete_finished_before(conn: &Connection, cutoff: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM jobs
         WHERE status IN ('succeeded', 'failed', 'cancelled') AND finished_at < ?1",
        [cutoff],
    )
    .map_err(sql_err)
}

/// Delete one job row.
pub fn delete_job(conn: &Connection, id: JobId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Number of persisted jobs per status.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(JobStatus, u64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
        .map_err(sql_err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    rows.into_iter()
        .map(|(status, n)| Ok((status.parse()?, n.max(0) as u64)))
        .collect()
}
