//! Mapping from SQLite failures onto the shared failure taxonomy.

use rk_core::Error;
use rusqlite::ErrorCode;

/// Convert a `rusqlite::Error` into an [`Error`] whose kind the retry policy
/// can act on.
///
/// Lock contention becomes `Unavailable` (retried with backoff), constraint
/// failures become `ConstraintViolation` (terminal), and disk I/O failures
/// become `TransientIo`.
pub fn sql_err(e: rusqlite::Error) -> Error {
    let code = match &e {
        rusqlite::Error::SqliteFailure(f, _) => Some(f.code),
        _ => None,
    };

    match code {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            Error::unavailable(format!("database busy: {e}"))
        }
        Some(ErrorCode::ConstraintViolation) => Error::ConstraintViolation(e.to_string()),
        Some(ErrorCode::SystemIoFailure) | Some(ErrorCode::DiskFull) => Error::TransientIo {
            source: std::io::Error::other(e.to_string()),
        },
        _ => Error::database(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rk_core::FailureKind;
    use rusqlite::Connection;

    #[test]
    fn constraint_failure_maps_to_constraint_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY);").unwrap();
        conn.execute("INSERT INTO t (k) VALUES ('a')", []).unwrap();
        let err = conn
            .execute("INSERT INTO t (k) VALUES ('a')", [])
            .map_err(sql_err)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConstraintViolation);
    }

    #[test]
    fn syntax_error_is_internal() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.execute_batch("SELEKT 1").map_err(sql_err).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Internal);
    }

    #[test]
    fn busy_maps_to_unavailable() {
        let failure = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err = sql_err(failure);
        assert_eq!(err.kind(), FailureKind::Unavailable);
        assert!(err.is_retryable());
    }
}
