//! Adaptive range queries.
//!
//! A requested range in days picks the granularity: raw heartbeats, minute
//! buckets, hour buckets with the last day verbatim, or day buckets.

use crate::db::{Bucket, Heartbeat, Resolution, Status};

use super::bucket::{steps_back, truncate_to_window, window_end};
use super::calculator::{FixedWindow, UptimeCalculator, WindowUptime};
use super::registry::CalculatorRegistry;
use super::UptimeError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Heartbeats returned in default mode.
pub const DEFAULT_HEARTBEAT_LIMIT: usize = 100;
/// Hours shown before the verbatim last day in hybrid mode (59 days).
pub const MAX_HYBRID_HOURS: usize = 1416;
pub const MAX_MINUTE_POINTS: usize = 1440;
pub const MAX_DAY_POINTS: usize = 365;

const NO_DATA: &str = "no data available";

/// One bar of a status timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub status: Status,
    pub time: DateTime<Utc>,
    pub ping: Option<f64>,
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
}

impl TimelinePoint {
    pub fn unknown(time: DateTime<Utc>) -> Self {
        Self {
            status: Status::Unknown,
            time,
            ping: None,
            msg: Some(NO_DATA.to_string()),
            date: None,
            uptime: None,
        }
    }

    pub fn from_bucket(bucket: &Bucket, status: Status) -> Self {
        let day = bucket.resolution == Resolution::Day;
        Self {
            status,
            time: bucket.start,
            ping: bucket.ping_avg.map(f64::round),
            msg: None,
            date: day.then(|| bucket.start.format("%Y-%m-%d").to_string()),
            uptime: if day { bucket.uptime() } else { None },
        }
    }

    pub fn from_heartbeat(heartbeat: &Heartbeat) -> Self {
        Self {
            status: heartbeat.status,
            time: heartbeat.time,
            ping: heartbeat.ping,
            msg: heartbeat.msg.clone(),
            date: None,
            uptime: None,
        }
    }
}

/// `{type, period}` metadata describing how a timeline was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub period: &'static str,
}

/// How a range query is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Heartbeats { limit: usize },
    Minute { points: usize },
    Hybrid { older_hours: usize },
    Day { points: usize },
}

impl Plan {
    pub fn for_range(range_days: f64) -> Result<Self, UptimeError> {
        if !range_days.is_finite() || range_days < 0.0 {
            return Err(UptimeError::InvalidRange(format!(
                "range_days must be a non-negative number, got {}",
                range_days
            )));
        }

        let plan = if range_days == 0.0 {
            Plan::Heartbeats {
                limit: DEFAULT_HEARTBEAT_LIMIT,
            }
        } else if range_days <= 1.0 {
            let points = ((range_days * 1440.0).floor() as usize).clamp(1, MAX_MINUTE_POINTS);
            Plan::Minute { points }
        } else if range_days <= 60.0 {
            let older_hours = (((range_days - 1.0) * 24.0).ceil() as usize).min(MAX_HYBRID_HOURS);
            Plan::Hybrid { older_hours }
        } else {
            Plan::Day {
                points: (range_days.ceil() as usize).min(MAX_DAY_POINTS),
            }
        };
        Ok(plan)
    }

    pub fn aggregation(&self) -> AggregationInfo {
        let (kind, period) = match self {
            Plan::Heartbeats { .. } => ("heartbeat", "individual heartbeats"),
            Plan::Minute { .. } => ("minute", "1 minute per bar"),
            Plan::Hybrid { .. } => ("hybrid", "hourly + recent detailed"),
            Plan::Day { .. } => ("day", "1 day per bar"),
        };
        AggregationInfo { kind, period }
    }
}

/// The last `count` windows at `resolution` ending with the one containing
/// `now`, oldest first. The newest window is reconciled through the
/// resolver; the rest come from the calculator's window or one store scan.
pub(crate) fn build_timeline(
    calculator: &UptimeCalculator,
    resolution: Resolution,
    count: usize,
    now: DateTime<Utc>,
) -> Result<Vec<TimelinePoint>, UptimeError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let newest = truncate_to_window(now, resolution);
    let mut points = bucket_points(calculator, resolution, newest, count - 1)?;

    let current = match calculator.reconcile(resolution, newest)? {
        Some(reconciled) => TimelinePoint::from_bucket(&reconciled.bucket, reconciled.status),
        None => TimelinePoint::unknown(newest),
    };
    points.push(current);
    Ok(points)
}

/// `count` windows ending just before `end`, gaps filled with UNKNOWN.
fn bucket_points(
    calculator: &UptimeCalculator,
    resolution: Resolution,
    end: DateTime<Utc>,
    count: usize,
) -> Result<Vec<TimelinePoint>, UptimeError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let start = steps_back(end, resolution, count as i64);
    let found: HashMap<DateTime<Utc>, Bucket> = calculator
        .collect(resolution, start, end)?
        .into_iter()
        .filter(|b| !b.is_empty())
        .map(|b| (b.start, b))
        .collect();

    let mut points = Vec::with_capacity(count + 1);
    let mut key = start;
    while key < end {
        points.push(match found.get(&key) {
            Some(bucket) => TimelinePoint::from_bucket(bucket, bucket.status()),
            None => TimelinePoint::unknown(key),
        });
        key = window_end(key, resolution);
    }
    Ok(points)
}

/// Hour buckets up to the hour containing `now - 24h`, then every heartbeat
/// of the last 24 hours.
fn hybrid_timeline(
    calculator: &UptimeCalculator,
    older_hours: usize,
    now: DateTime<Utc>,
) -> Result<Vec<TimelinePoint>, UptimeError> {
    let day_ago = now - ChronoDuration::hours(24);
    let last_hour = truncate_to_window(day_ago, Resolution::Hour);
    let mut points = bucket_points(
        calculator,
        Resolution::Hour,
        window_end(last_hour, Resolution::Hour),
        older_hours,
    )?;

    let recent = calculator.heartbeats_between(
        day_ago + ChronoDuration::seconds(1),
        now + ChronoDuration::hours(1),
    )?;
    points.extend(recent.iter().map(TimelinePoint::from_heartbeat));
    Ok(points)
}

/// A monitor's timeline, uptime and how the timeline was aggregated.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorTimeline {
    pub monitor_id: i64,
    pub heartbeats: Vec<TimelinePoint>,
    pub uptime: f64,
    pub aggregation: AggregationInfo,
}

/// Share of UP points, counting UNKNOWN points in the denominator.
pub fn timeline_uptime(points: &[TimelinePoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let up = points.iter().filter(|p| p.status == Status::Up).count();
    up as f64 / points.len() as f64
}

/// `count` UNKNOWN points ending with the window starting at `newest`.
fn unknown_points(
    resolution: Resolution,
    newest: DateTime<Utc>,
    count: usize,
) -> Vec<TimelinePoint> {
    (0..count as i64)
        .rev()
        .map(|i| TimelinePoint::unknown(steps_back(newest, resolution, i)))
        .collect()
}

fn timeline_for(
    calculator: &UptimeCalculator,
    plan: Plan,
    now: DateTime<Utc>,
) -> Result<(Vec<TimelinePoint>, f64), UptimeError> {
    let heartbeats = match plan {
        Plan::Heartbeats { limit } => {
            let heartbeats: Vec<_> = calculator
                .recent_heartbeats(limit)?
                .iter()
                .map(TimelinePoint::from_heartbeat)
                .collect();
            let uptime = calculator.fixed_window_uptime(FixedWindow::Day)?.uptime;
            return Ok((heartbeats, uptime));
        }
        Plan::Minute { points } => build_timeline(calculator, Resolution::Minute, points, now)?,
        Plan::Hybrid { older_hours } => hybrid_timeline(calculator, older_hours, now)?,
        Plan::Day { points } => build_timeline(calculator, Resolution::Day, points, now)?,
    };
    let uptime = timeline_uptime(&heartbeats);
    Ok((heartbeats, uptime))
}

/// The timeline of a monitor with no history at all.
fn empty_timeline(plan: Plan, now: DateTime<Utc>) -> Vec<TimelinePoint> {
    match plan {
        Plan::Heartbeats { .. } => Vec::new(),
        Plan::Minute { points } => {
            unknown_points(Resolution::Minute, truncate_to_window(now, Resolution::Minute), points)
        }
        Plan::Hybrid { older_hours } => {
            let day_ago = now - ChronoDuration::hours(24);
            let last_hour = truncate_to_window(day_ago, Resolution::Hour);
            unknown_points(Resolution::Hour, last_hour, older_hours)
        }
        Plan::Day { points } => {
            unknown_points(Resolution::Day, truncate_to_window(now, Resolution::Day), points)
        }
    }
}

/// Runs range queries with a bound on how many execute at once.
///
/// Every read of a monitor's history goes through here. Monitors with no
/// history are answered with UNKNOWN points and never get a calculator.
pub struct RangePlanner {
    registry: Arc<CalculatorRegistry>,
    permits: Semaphore,
}

impl RangePlanner {
    pub fn new(registry: Arc<CalculatorRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, UptimeError> {
        self.permits.acquire().await.map_err(|_| UptimeError::Shutdown)
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.backend().clock.now()
    }

    /// Uptime over a fixed window; 0 for a monitor with no history.
    pub async fn fixed_window(
        &self,
        monitor_id: i64,
        duration: FixedWindow,
    ) -> Result<WindowUptime, UptimeError> {
        let _permit = self.permit().await?;
        match self.registry.lookup(monitor_id).await? {
            Some(calculator) => calculator.fixed_window_uptime(duration),
            None => Ok(WindowUptime {
                duration,
                uptime: 0.0,
                avg_ping: None,
            }),
        }
    }

    /// The last `count` buckets at `resolution`, gaps filled with UNKNOWN.
    pub async fn data_array(
        &self,
        monitor_id: i64,
        count: usize,
        resolution: Resolution,
    ) -> Result<Vec<TimelinePoint>, UptimeError> {
        let _permit = self.permit().await?;
        match self.registry.lookup(monitor_id).await? {
            Some(calculator) => calculator.data_array(count, resolution),
            None => {
                let newest = truncate_to_window(self.now(), resolution);
                Ok(unknown_points(resolution, newest, count))
            }
        }
    }

    pub async fn reconcile(
        &self,
        monitor_id: i64,
        range_days: f64,
    ) -> Result<MonitorTimeline, UptimeError> {
        let plan = Plan::for_range(range_days)?;
        let _permit = self.permit().await?;

        let (heartbeats, uptime) = match self.registry.lookup(monitor_id).await? {
            Some(calculator) => {
                calculator.refresh();
                timeline_for(&calculator, plan, calculator.now())?
            }
            None => {
                let heartbeats = empty_timeline(plan, self.now());
                let uptime = timeline_uptime(&heartbeats);
                (heartbeats, uptime)
            }
        };

        tracing::debug!(
            "Planner: monitor {} range {}d answered with {} {} points",
            monitor_id,
            range_days,
            heartbeats.len(),
            plan.aggregation().kind
        );

        Ok(MonitorTimeline {
            monitor_id,
            heartbeats,
            uptime,
            aggregation: plan.aggregation(),
        })
    }
}
