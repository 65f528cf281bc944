//! Rollup engine for folding heartbeats into minute, hour and day buckets.
//!
//! Only the minute bucket is fed directly. When a minute closes it is summed
//! into its hour, and a closing hour is summed into its day, so every parent
//! is exactly the sum of its closed children. Closed buckets are queued for
//! persistence and never reopened.

use crate::db::{Bucket, BucketStore, DbError, Heartbeat, Resolution};

use super::bucket::truncate_to_window;
use chrono::{DateTime, Utc};

/// What happened to an ingested heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Counted into the open minute bucket.
    Folded,
    /// Its minute had already closed; kept in the event log only.
    Late,
}

/// Open buckets and closure state for one monitor.
#[derive(Debug)]
pub struct RollupEngine {
    monitor_id: i64,
    minute: Option<Bucket>,
    hour: Option<Bucket>,
    day: Option<Bucket>,
    /// Every bucket ending at or before this instant has been closed.
    closed_through: Option<DateTime<Utc>>,
    /// Closed buckets not yet written to the bucket store.
    unpersisted: Vec<Bucket>,
}

impl RollupEngine {
    pub fn new(monitor_id: i64) -> Self {
        Self {
            monitor_id,
            minute: None,
            hour: None,
            day: None,
            closed_through: None,
            unpersisted: Vec::new(),
        }
    }

    /// Resume from open buckets rebuilt out of storage.
    pub fn restore(
        monitor_id: i64,
        minute: Option<Bucket>,
        hour: Option<Bucket>,
        day: Option<Bucket>,
        closed_through: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            minute: minute.filter(|b| !b.is_empty()),
            hour: hour.filter(|b| !b.is_empty()),
            day: day.filter(|b| !b.is_empty()),
            closed_through,
            ..Self::new(monitor_id)
        }
    }

    pub fn closed_through(&self) -> Option<DateTime<Utc>> {
        self.closed_through
    }

    /// Whether a heartbeat at `time` falls into an already closed minute.
    pub fn is_late(&self, time: DateTime<Utc>) -> bool {
        let key = truncate_to_window(time, Resolution::Minute);
        self.closed_through.is_some_and(|closed| key < closed)
    }

    /// Fold a heartbeat into its minute bucket, first closing every bucket
    /// that ended before that minute. Returns the buckets closed on the way.
    pub fn ingest(&mut self, heartbeat: &Heartbeat) -> (Ingested, Vec<Bucket>) {
        if self.is_late(heartbeat.time) {
            return (Ingested::Late, Vec::new());
        }

        let key = truncate_to_window(heartbeat.time, Resolution::Minute);
        let closed = self.advance(key);

        let monitor_id = self.monitor_id;
        self.minute
            .get_or_insert_with(|| Bucket::empty(monitor_id, Resolution::Minute, key))
            .fold(heartbeat);

        (Ingested::Folded, closed)
    }

    /// Close every open bucket whose window ends at or before `watermark`.
    /// Calling this again with the same or an earlier watermark is a no-op.
    pub fn advance(&mut self, watermark: DateTime<Utc>) -> Vec<Bucket> {
        // The minute containing the watermark may still receive heartbeats.
        let watermark = truncate_to_window(watermark, Resolution::Minute);
        let mut closed = Vec::new();
        if self.closed_through.is_some_and(|c| c >= watermark) {
            return closed;
        }

        if self.minute.as_ref().is_some_and(|b| b.end() <= watermark) {
            if let Some(minute) = self.minute.take() {
                self.close_minute(minute, &mut closed);
            }
        }
        if self.hour.as_ref().is_some_and(|b| b.end() <= watermark) {
            if let Some(hour) = self.hour.take() {
                self.close_hour(hour, &mut closed);
            }
        }
        if self.day.as_ref().is_some_and(|b| b.end() <= watermark) {
            if let Some(day) = self.day.take() {
                closed.push(day);
            }
        }

        self.closed_through = Some(watermark);
        self.unpersisted.extend(closed.iter().cloned());
        closed
    }

    fn close_minute(&mut self, minute: Bucket, closed: &mut Vec<Bucket>) {
        let key = truncate_to_window(minute.start, Resolution::Hour);
        if self.hour.as_ref().is_some_and(|h| h.start < key) {
            if let Some(stale) = self.hour.take() {
                self.close_hour(stale, closed);
            }
        }

        let monitor_id = self.monitor_id;
        self.hour
            .get_or_insert_with(|| Bucket::empty(monitor_id, Resolution::Hour, key))
            .merge(&minute);
        tracing::debug!(
            "Rollup: closed minute {} for monitor {} (up={}, down={})",
            minute.start.format("%H:%M"),
            monitor_id,
            minute.up,
            minute.down
        );
        closed.push(minute);
    }

    fn close_hour(&mut self, hour: Bucket, closed: &mut Vec<Bucket>) {
        let key = truncate_to_window(hour.start, Resolution::Day);
        if self.day.as_ref().is_some_and(|d| d.start < key) {
            if let Some(stale) = self.day.take() {
                closed.push(stale);
            }
        }

        let monitor_id = self.monitor_id;
        self.day
            .get_or_insert_with(|| Bucket::empty(monitor_id, Resolution::Day, key))
            .merge(&hour);
        closed.push(hour);
    }

    /// Current values of the open windows, coarser ones including the
    /// contents of the finer open ones. Ordered minute, hour, day.
    pub fn live(&self) -> Vec<Bucket> {
        let mut out = Vec::with_capacity(3);
        let mut carry: Option<Bucket> = None;

        for (resolution, open) in [
            (Resolution::Minute, &self.minute),
            (Resolution::Hour, &self.hour),
            (Resolution::Day, &self.day),
        ] {
            let live = match (open, carry.take()) {
                (Some(b), Some(child))
                    if b.start == truncate_to_window(child.start, resolution) =>
                {
                    let mut b = b.clone();
                    b.merge(&child);
                    b
                }
                (Some(b), Some(child)) => {
                    out.push(b.clone());
                    self.wrap(resolution, &child)
                }
                (Some(b), None) => b.clone(),
                (None, Some(child)) => self.wrap(resolution, &child),
                (None, None) => continue,
            };
            out.push(live.clone());
            carry = Some(live);
        }

        out
    }

    fn wrap(&self, resolution: Resolution, child: &Bucket) -> Bucket {
        let key = truncate_to_window(child.start, resolution);
        Bucket::rollup(self.monitor_id, resolution, key, [child])
    }

    /// Write queued closed buckets. On failure they stay queued for the
    /// next attempt.
    pub fn flush(&mut self, store: &dyn BucketStore) -> Result<usize, DbError> {
        if self.unpersisted.is_empty() {
            return Ok(0);
        }
        let written = store.insert_buckets(&self.unpersisted)?;
        self.unpersisted.clear();
        Ok(written)
    }

    pub fn unpersisted(&self) -> usize {
        self.unpersisted.len()
    }
}
