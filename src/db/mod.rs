//! Database module for PostgreSQL connectivity
//!
//! Pool setup plus the sqlx implementation of the query engine's backend seam.

pub mod connection;
pub mod postgres;

pub use connection::{init_pool, DbPool, PostgresConfig};
pub use postgres::PostgresBackend;
