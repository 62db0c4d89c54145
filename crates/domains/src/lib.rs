//! hyperlocal/crates/domains/src/lib.rs
//!
//! Entities, error taxonomy and port definitions for the hyperlocal
//! content integrity & moderation engine. No I/O lives here.

pub mod errors;
pub mod geo;
pub mod models;
pub mod ports;

// Re-exporting for easier access in other crates
pub use errors::*;
pub use geo::*;
pub use models::*;
pub use ports::*;
