//! # Storage Adapters
//!
//! Repository port implementations. The in-memory store is always compiled;
//! Postgres/PostGIS sits behind the `db-postgres` feature.

pub mod memory;
#[cfg(feature = "db-postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "db-postgres")]
pub use postgres::PgStore;
