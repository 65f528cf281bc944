//! Per-monitor uptime calculator.
//!
//! Owns the roll-up state and the in-memory sliding windows for one monitor.
//! All mutation happens under the write half of a single lock, so readers
//! see a bucket either before or after a closure, never halfway.

use crate::clock::Clock;
use crate::db::{Bucket, BucketStore, EventLog, Heartbeat, Resolution, SortOrder, Status};

use super::bucket::{steps_back, truncate_to_window, window_end};
use super::planner::{build_timeline, TimelinePoint};
use super::resolver::{Reconciled, ResolveContext, Resolver};
use super::rollup::{Ingested, RollupEngine};
use super::window::SlidingWindow;
use super::UptimeError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Window capacities: 24 hours of minutes, 30 days of hours, a year of days.
pub const MINUTE_WINDOW: usize = 1440;
pub const HOUR_WINDOW: usize = 720;
pub const DAY_WINDOW: usize = 365;

/// How far ahead of the clock a heartbeat timestamp may be.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Shared dependencies handed to every calculator.
#[derive(Clone)]
pub struct Backend {
    pub buckets: Arc<dyn BucketStore>,
    pub events: Arc<dyn EventLog>,
    pub clock: Arc<dyn Clock>,
    pub resolver: Arc<Resolver>,
    /// Reads only close buckets that ended at least this long ago.
    pub close_grace: ChronoDuration,
}

/// The fixed uptime windows served from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FixedWindow {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "1y")]
    Year,
}

impl FixedWindow {
    pub fn resolution(self) -> Resolution {
        match self {
            FixedWindow::Day => Resolution::Minute,
            FixedWindow::Week | FixedWindow::Month => Resolution::Hour,
            FixedWindow::Year => Resolution::Day,
        }
    }

    pub fn points(self) -> usize {
        match self {
            FixedWindow::Day => 1440,
            FixedWindow::Week => 168,
            FixedWindow::Month => 720,
            FixedWindow::Year => 365,
        }
    }
}

impl FromStr for FixedWindow {
    type Err = UptimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(FixedWindow::Day),
            "7d" => Ok(FixedWindow::Week),
            "30d" => Ok(FixedWindow::Month),
            "1y" => Ok(FixedWindow::Year),
            other => Err(UptimeError::UnknownDuration(other.to_string())),
        }
    }
}

/// Uptime over a fixed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUptime {
    pub duration: FixedWindow,
    pub uptime: f64,
    pub avg_ping: Option<f64>,
}

struct CalculatorState {
    rollup: RollupEngine,
    minute: SlidingWindow,
    hour: SlidingWindow,
    day: SlidingWindow,
}

impl CalculatorState {
    fn window(&self, resolution: Resolution) -> &SlidingWindow {
        match resolution {
            Resolution::Minute => &self.minute,
            Resolution::Hour => &self.hour,
            Resolution::Day => &self.day,
        }
    }

    fn window_mut(&mut self, resolution: Resolution) -> &mut SlidingWindow {
        match resolution {
            Resolution::Minute => &mut self.minute,
            Resolution::Hour => &mut self.hour,
            Resolution::Day => &mut self.day,
        }
    }

    /// Push closed buckets and the current open values into the windows.
    fn apply(&mut self, closed: Vec<Bucket>) {
        for bucket in closed.into_iter().chain(self.rollup.live()) {
            self.window_mut(bucket.resolution).upsert(bucket);
        }
    }
}

pub struct UptimeCalculator {
    monitor_id: i64,
    backend: Backend,
    state: RwLock<CalculatorState>,
}

impl UptimeCalculator {
    /// Build a calculator from storage: rebuild the open buckets, close
    /// whatever elapsed while nobody was watching, and load the windows.
    pub fn hydrate(monitor_id: i64, backend: Backend) -> Result<Self, UptimeError> {
        let now = backend.clock.now();
        let mut rollup = restore_rollup(monitor_id, &backend)?;
        let closed = rollup.advance(now - backend.close_grace);

        let mut state = CalculatorState {
            rollup,
            minute: SlidingWindow::new(Resolution::Minute, MINUTE_WINDOW),
            hour: SlidingWindow::new(Resolution::Hour, HOUR_WINDOW),
            day: SlidingWindow::new(Resolution::Day, DAY_WINDOW),
        };

        for resolution in Resolution::ALL {
            let window = state.window_mut(resolution);
            let newest = truncate_to_window(now, resolution);
            let capacity = window_capacity(resolution) as i64;
            let covered_from = steps_back(newest, resolution, capacity - 1);
            let rows = backend.buckets.get_buckets(
                monitor_id,
                resolution,
                covered_from,
                window_end(newest, resolution),
                SortOrder::Asc,
            )?;
            window.hydrate(covered_from, rows);
        }
        state.apply(closed);

        let calculator = Self {
            monitor_id,
            backend,
            state: RwLock::new(state),
        };
        calculator.flush(&mut calculator.write());

        {
            let state = calculator.read();
            tracing::info!(
                "Calculator: hydrated monitor {} ({} minute, {} hour, {} day buckets)",
                monitor_id,
                state.minute.len(),
                state.hour.len(),
                state.day.len()
            );
        }

        Ok(calculator)
    }

    pub fn monitor_id(&self) -> i64 {
        self.monitor_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.backend.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, CalculatorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CalculatorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a heartbeat: append it to the event log and fold it into the
    /// open minute unless that minute has already closed.
    pub fn update(&self, mut heartbeat: Heartbeat) -> Result<Ingested, UptimeError> {
        self.validate(&heartbeat)?;
        heartbeat.time =
            DateTime::from_timestamp(heartbeat.time.timestamp(), 0).unwrap_or(heartbeat.time);

        let mut state = self.write();
        heartbeat.late = state.rollup.is_late(heartbeat.time);
        self.backend.events.append_heartbeat(&heartbeat)?;

        if heartbeat.late {
            tracing::warn!(
                "Calculator: late heartbeat for monitor {} at {} kept out of closed buckets",
                self.monitor_id,
                heartbeat.time
            );
            return Ok(Ingested::Late);
        }

        let (outcome, closed) = state.rollup.ingest(&heartbeat);
        state.apply(closed);
        self.flush(&mut state);
        Ok(outcome)
    }

    fn validate(&self, heartbeat: &Heartbeat) -> Result<(), UptimeError> {
        if heartbeat.monitor_id != self.monitor_id {
            return Err(UptimeError::InvalidHeartbeat(format!(
                "heartbeat for monitor {} sent to monitor {}",
                heartbeat.monitor_id, self.monitor_id
            )));
        }
        if heartbeat.status == Status::Unknown {
            return Err(UptimeError::InvalidHeartbeat(
                "status UNKNOWN cannot be recorded".to_string(),
            ));
        }
        if let Some(ping) = heartbeat.ping {
            if !ping.is_finite() || ping < 0.0 {
                return Err(UptimeError::InvalidHeartbeat(format!("invalid ping {}", ping)));
            }
        }
        let limit = self.now() + ChronoDuration::seconds(MAX_CLOCK_SKEW_SECS);
        if heartbeat.time > limit {
            return Err(UptimeError::InvalidHeartbeat(format!(
                "timestamp {} is in the future",
                heartbeat.time
            )));
        }
        Ok(())
    }

    /// Close buckets that ended before `now - close_grace`.
    pub fn refresh(&self) {
        let watermark =
            truncate_to_window(self.now() - self.backend.close_grace, Resolution::Minute);
        {
            let state = self.read();
            let current = state.rollup.closed_through().is_some_and(|c| c >= watermark);
            if current && state.rollup.unpersisted() == 0 {
                return;
            }
        }

        let mut state = self.write();
        let closed = state.rollup.advance(watermark);
        state.apply(closed);
        self.flush(&mut state);
    }

    fn flush(&self, state: &mut CalculatorState) {
        match state.rollup.flush(self.backend.buckets.as_ref()) {
            Ok(0) => {}
            Ok(written) => tracing::debug!(
                "Calculator: persisted {} closed buckets for monitor {}",
                written,
                self.monitor_id
            ),
            Err(e) => tracing::error!(
                "Calculator: failed to persist {} closed buckets for monitor {}: {}",
                state.rollup.unpersisted(),
                self.monitor_id,
                e
            ),
        }
    }

    /// Uptime over one of the fixed windows.
    pub fn fixed_window_uptime(&self, duration: FixedWindow) -> Result<WindowUptime, UptimeError> {
        self.refresh();

        let resolution = duration.resolution();
        let newest = truncate_to_window(self.now(), resolution);
        let start = steps_back(newest, resolution, duration.points() as i64 - 1);
        let buckets = self.collect(resolution, start, window_end(newest, resolution))?;

        let total = Bucket::rollup(self.monitor_id, resolution, start, &buckets);
        Ok(WindowUptime {
            duration,
            uptime: total.uptime().unwrap_or(0.0),
            avg_ping: total.ping_avg,
        })
    }

    /// The last `count` buckets at `resolution`, gaps filled with UNKNOWN.
    pub fn data_array(
        &self,
        count: usize,
        resolution: Resolution,
    ) -> Result<Vec<TimelinePoint>, UptimeError> {
        self.refresh();
        build_timeline(self, resolution, count, self.now())
    }

    /// Buckets in `[start, end)` from the window, reading storage only for
    /// the part older than the window holds.
    pub(crate) fn collect(
        &self,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, UptimeError> {
        let (covered_from, recent) = {
            let state = self.read();
            let window = state.window(resolution);
            let covered_from = window.covered_from().unwrap_or(end).max(start).min(end);
            (covered_from, window.range(covered_from, end))
        };

        if covered_from <= start {
            return Ok(recent);
        }

        let mut buckets = self.backend.buckets.get_buckets(
            self.monitor_id,
            resolution,
            start,
            covered_from,
            SortOrder::Asc,
        )?;
        buckets.extend(recent);
        Ok(buckets)
    }

    /// Reconcile a single bucket through the resolver tiers.
    pub fn reconcile(
        &self,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Reconciled>, UptimeError> {
        let cx = ResolveContext {
            monitor_id: self.monitor_id,
            buckets: self.backend.buckets.as_ref(),
            events: self.backend.events.as_ref(),
            now: self.now(),
        };
        self.backend.resolver.resolve(&cx, resolution, start)
    }

    /// Heartbeats with `start <= time < end`, oldest first.
    pub fn heartbeats_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Heartbeat>, UptimeError> {
        Ok(self
            .backend
            .events
            .get_heartbeats(self.monitor_id, start, end, SortOrder::Asc, None)?)
    }

    /// The newest `limit` heartbeats, oldest first.
    pub fn recent_heartbeats(&self, limit: usize) -> Result<Vec<Heartbeat>, UptimeError> {
        let mut heartbeats = self.backend.events.recent_heartbeats(self.monitor_id, limit)?;
        heartbeats.reverse();
        Ok(heartbeats)
    }

    pub fn latest_heartbeat(&self) -> Result<Option<Heartbeat>, UptimeError> {
        Ok(self.backend.events.latest_heartbeat(self.monitor_id)?)
    }
}

fn window_capacity(resolution: Resolution) -> usize {
    match resolution {
        Resolution::Minute => MINUTE_WINDOW,
        Resolution::Hour => HOUR_WINDOW,
        Resolution::Day => DAY_WINDOW,
    }
}

/// Rebuild the open minute, hour and day around the newest heartbeat.
fn restore_rollup(monitor_id: i64, backend: &Backend) -> Result<RollupEngine, UptimeError> {
    let Some(latest) = backend.events.latest_heartbeat(monitor_id)? else {
        return Ok(RollupEngine::new(monitor_id));
    };
    let buckets = backend.buckets.as_ref();

    let minute_key = truncate_to_window(latest.time, Resolution::Minute);
    let minute_end = window_end(minute_key, Resolution::Minute);
    let minute_persisted = buckets
        .get_bucket(monitor_id, Resolution::Minute, minute_key)?
        .is_some();
    let (minute, closed_through) = if minute_persisted {
        (None, minute_end)
    } else {
        let mut open = Bucket::empty(monitor_id, Resolution::Minute, minute_key);
        for hb in backend
            .events
            .get_heartbeats(monitor_id, minute_key, minute_end, SortOrder::Asc, None)?
            .iter()
            .filter(|hb| !hb.late)
        {
            open.fold(hb);
        }
        (Some(open), minute_key)
    };

    let hour = open_parent(buckets, monitor_id, Resolution::Hour, latest.time)?;
    let day = open_parent(buckets, monitor_id, Resolution::Day, latest.time)?;

    Ok(RollupEngine::restore(monitor_id, minute, hour, day, Some(closed_through)))
}

/// Sum persisted children of the window containing `time`, unless that
/// window was already finalized.
fn open_parent(
    buckets: &dyn BucketStore,
    monitor_id: i64,
    resolution: Resolution,
    time: DateTime<Utc>,
) -> Result<Option<Bucket>, UptimeError> {
    let start = truncate_to_window(time, resolution);
    if buckets.get_bucket(monitor_id, resolution, start)?.is_some() {
        return Ok(None);
    }
    let Some(finer) = resolution.finer() else {
        return Ok(None);
    };
    let children = buckets.get_buckets(
        monitor_id,
        finer,
        start,
        window_end(start, resolution),
        SortOrder::Asc,
    )?;
    Ok(Some(Bucket::rollup(monitor_id, resolution, start, &children)))
}
