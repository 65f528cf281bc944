//! Uptime engine: heartbeat roll-up, per-monitor calculators, tiered
//! reconciliation and adaptive range queries.

mod bucket;
mod calculator;
mod planner;
mod registry;
mod resolver;
mod rollup;
mod summary;
mod window;

pub use bucket::*;
pub use calculator::*;
pub use planner::*;
pub use registry::*;
pub use resolver::*;
pub use rollup::*;
pub use summary::*;
pub use window::*;

use crate::db::DbError;
use thiserror::Error;

/// Uptime engine error types.
#[derive(Error, Debug)]
pub enum UptimeError {
    #[error("invalid heartbeat: {0}")]
    InvalidHeartbeat(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("unknown duration: {0}")]
    UnknownDuration(String),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] DbError),
    #[error("query limiter closed")]
    Shutdown,
}
