//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Days of raw heartbeats to keep (default: 180)
    pub keep_data_days: i64,
    /// Range queries allowed to run at once (default: 8)
    pub query_concurrency: usize,
    /// Seconds after a bucket ends before reads close it (default: 60)
    pub close_grace_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            keep_data_days: 180,
            query_concurrency: 8,
            close_grace_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_KEEP_DATA_DAYS`: Raw heartbeat retention in days (default: 180)
    /// - `UPTRAIL_QUERY_CONCURRENCY`: Concurrent range queries (default: 8)
    /// - `UPTRAIL_CLOSE_GRACE_SECS`: Bucket close grace period (default: 60)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        parse_into(&lookup, "UPTRAIL_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        parse_into(&lookup, "UPTRAIL_KEEP_DATA_DAYS", &mut cfg.keep_data_days);
        parse_into(&lookup, "UPTRAIL_QUERY_CONCURRENCY", &mut cfg.query_concurrency);
        parse_into(&lookup, "UPTRAIL_CLOSE_GRACE_SECS", &mut cfg.close_grace_secs);

        cfg.keep_data_days = cfg.keep_data_days.max(1);
        cfg.query_concurrency = cfg.query_concurrency.max(1);
        cfg.close_grace_secs = cfg.close_grace_secs.max(0);
        cfg
    }
}

/// Overwrite `target` when `key` is set and parses; otherwise keep the default.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Config: ignoring invalid {}={:?}", key, value),
        }
    }
}
