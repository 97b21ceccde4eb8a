//! Unit of Work: one SQLite transaction grouping repository writes.
//!
//! A unit takes the write lock up front (`BEGIN IMMEDIATE`) so lock
//! contention shows up at `begin` rather than midway through a job's
//! writes. Dropping a unit without committing rolls it back, and a failed
//! commit also rolls back, so no partial state is ever visible to readers.

use rk_core::{Deadline, Result};
use rusqlite::Connection;

use crate::error::sql_err;
use crate::pool::{get_conn_within, DbPool, PooledConnection};
use crate::repository::{Entity, Repository};

pub struct UnitOfWork {
    conn: PooledConnection,
    deadline: Deadline,
    open: bool,
}

impl UnitOfWork {
    /// Open a transaction. Waiting for a connection or for the write lock
    /// past `deadline` fails with `Unavailable`.
    pub fn begin(pool: &DbPool, deadline: Deadline) -> Result<Self> {
        let conn = get_conn_within(pool, deadline)?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        Ok(Self {
            conn,
            deadline,
            open: true,
        })
    }

    /// Run `f` inside a fresh unit, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn run<T>(
        pool: &DbPool,
        deadline: Deadline,
        f: impl FnOnce(&UnitOfWork) -> Result<T>,
    ) -> Result<T> {
        let uow = Self::begin(pool, deadline)?;
        match f(&uow) {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(e) => {
                uow.rollback()?;
                Err(e)
            }
        }
    }

    /// Repository for entity `E` bound to this transaction.
    pub fn repository<E: Entity>(&self) -> Repository<'_, E> {
        Repository::new(&self.conn)
    }

    /// Raw transaction connection, for queries with no repository method.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Commit all writes. On failure (including an expired deadline) the
    /// transaction is rolled back before the error is returned.
    pub fn commit(mut self) -> Result<()> {
        if let Err(e) = self.deadline.check("commit") {
            self.abort();
            return Err(e);
        }
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.open = false;
                Ok(())
            }
            Err(e) => {
                self.abort();
                Err(sql_err(e))
            }
        }
    }

    /// Discard all writes.
    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK").map_err(sql_err)
    }

    fn abort(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.abort();
    }
}
