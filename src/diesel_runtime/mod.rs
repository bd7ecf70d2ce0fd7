//! Diesel runtime
//!
//! PostgreSQL storage backend: an r2d2 connection pool and a [`PgStore`]
//! implementing [`crate::storage::Storage`] with generated SQL.

pub mod database;
pub mod sql;
pub mod store;

pub use database::{Database, DatabaseError, Pool, PooledConnection};
pub use store::PgStore;
