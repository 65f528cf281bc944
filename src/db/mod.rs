//! Database module for uptrail.
//!
//! Provides the SQLite-backed bucket store and heartbeat log.

mod models;
mod store;

pub use models::*;
pub use store::*;
