//! rk-db: database access and persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, typed models, per-table query modules, and the
//! [`UnitOfWork`](uow::UnitOfWork) transaction boundary through which every
//! job writes.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod repository;
pub mod uow;

pub use error::sql_err;
pub use pool::{get_conn, get_conn_within, init_memory_pool, init_pool, DbPool, PooledConnection};
pub use repository::{Entity, Repository};
pub use uow::UnitOfWork;
