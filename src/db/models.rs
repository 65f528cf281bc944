//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field validation errors raised when decoding rows or requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("invalid status code: {0}")]
    Status(u8),
    #[error("invalid resolution: {0}")]
    Resolution(String),
    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
    #[error("negative count in column {0}")]
    Count(&'static str),
}

/// Heartbeat and timeline status.
///
/// Serialized as its numeric code: `0=DOWN, 1=UP, 2=PENDING, 3=MAINTENANCE, 4=UNKNOWN`.
/// `Unknown` only ever appears in timelines, never in a stored heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Down,
    Up,
    Pending,
    Maintenance,
    Unknown,
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Down => 0,
            Status::Up => 1,
            Status::Pending => 2,
            Status::Maintenance => 3,
            Status::Unknown => 4,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = FieldError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Status::Down),
            1 => Ok(Status::Up),
            2 => Ok(Status::Pending),
            3 => Ok(Status::Maintenance),
            4 => Ok(Status::Unknown),
            other => Err(FieldError::Status(other)),
        }
    }
}

/// Bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Minute, Resolution::Hour, Resolution::Day];

    /// Bucket width in seconds. Also the `window_seconds` key in storage.
    pub fn window_seconds(self) -> i64 {
        match self {
            Resolution::Minute => 60,
            Resolution::Hour => 3_600,
            Resolution::Day => 86_400,
        }
    }

    pub fn from_window_seconds(window_seconds: i64) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.window_seconds() == window_seconds)
    }

    /// The tier whose buckets roll up into this one.
    pub fn finer(self) -> Option<Self> {
        match self {
            Resolution::Minute => None,
            Resolution::Hour => Some(Resolution::Minute),
            Resolution::Day => Some(Resolution::Hour),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Resolution::Minute),
            "hour" => Ok(Resolution::Hour),
            "day" => Ok(Resolution::Day),
            other => Err(FieldError::Resolution(other.to_string())),
        }
    }
}

/// A single health-check result.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub monitor_id: i64,
    pub time: DateTime<Utc>,
    pub status: Status,
    /// Latency in milliseconds.
    pub ping: Option<f64>,
    pub msg: Option<String>,
    /// Recorded after its minute bucket had already closed.
    pub late: bool,
}

impl Heartbeat {
    pub fn new(monitor_id: i64, time: DateTime<Utc>, status: Status) -> Self {
        Self {
            monitor_id,
            time,
            status,
            ping: None,
            msg: None,
            late: false,
        }
    }

    pub fn with_ping(mut self, ping: f64) -> Self {
        self.ping = Some(ping);
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }
}

/// Aggregated counts for one monitor over one aligned time window.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub monitor_id: i64,
    pub resolution: Resolution,
    /// Window start, aligned to the resolution boundary in UTC.
    pub start: DateTime<Utc>,
    pub up: u64,
    pub down: u64,
    pub maintenance: u64,
    /// Number of heartbeats folded in, of any status.
    pub weight: u64,
    pub ping_avg: Option<f64>,
    /// Number of non-null latency samples behind `ping_avg`.
    pub ping_count: u64,
    pub ping_min: Option<f64>,
    pub ping_max: Option<f64>,
}

impl Bucket {
    pub fn empty(monitor_id: i64, resolution: Resolution, start: DateTime<Utc>) -> Self {
        Self {
            monitor_id,
            resolution,
            start,
            up: 0,
            down: 0,
            maintenance: 0,
            weight: 0,
            ping_avg: None,
            ping_count: 0,
            ping_min: None,
            ping_max: None,
        }
    }
}

/// Row counts for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub heartbeats: i64,
    pub minute_buckets: i64,
    pub hour_buckets: i64,
    pub day_buckets: i64,
}
