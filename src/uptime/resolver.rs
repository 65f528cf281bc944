//! Tiered reconciliation of a single bucket.
//!
//! A bucket that has not been finalized yet still needs an answer. The
//! resolver tries an ordered list of tiers, first hit wins:
//!
//! 1. the finalized aggregate row,
//! 2. the sum of finalized rows one resolution finer,
//! 3. a scan of the raw heartbeat log.
//!
//! Nothing found means UNKNOWN. A tier whose storage call fails is skipped;
//! only when every tier that applies fails does the caller see an error.

use crate::db::{Bucket, BucketStore, DbError, EventLog, Resolution, SortOrder, Status};

use super::bucket::{truncate_to_window, window_end};
use super::UptimeError;
use chrono::{DateTime, Utc};
use std::fmt;

/// Which tier produced a reconciled bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Finalized,
    FinerAggregate,
    RawEvents,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Finalized => "finalized",
            Tier::FinerAggregate => "finer-aggregate",
            Tier::RawEvents => "raw-events",
        })
    }
}

/// A bucket value together with the status to show for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub bucket: Bucket,
    pub tier: Tier,
    pub status: Status,
}

/// Storage handles and the instant a reconciliation runs at.
pub struct ResolveContext<'a> {
    pub monitor_id: i64,
    pub buckets: &'a dyn BucketStore,
    pub events: &'a dyn EventLog,
    pub now: DateTime<Utc>,
}

/// One way of producing a bucket's value.
pub trait ResolveTier: Send + Sync {
    fn tier(&self) -> Tier;

    /// Whether this tier can answer at `resolution` at all.
    fn applies(&self, _resolution: Resolution) -> bool {
        true
    }

    fn resolve(
        &self,
        resolver: &Resolver,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError>;
}

pub struct FinalizedRow;

impl ResolveTier for FinalizedRow {
    fn tier(&self) -> Tier {
        Tier::Finalized
    }

    fn resolve(
        &self,
        _resolver: &Resolver,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError> {
        cx.buckets.get_bucket(cx.monitor_id, resolution, start)
    }
}

/// Sums finalized finer rows. While the bucket is still open, the finer
/// windows after the newest finalized row are reconciled recursively so the
/// open day includes the open hour.
pub struct FinerAggregate;

impl ResolveTier for FinerAggregate {
    fn tier(&self) -> Tier {
        Tier::FinerAggregate
    }

    fn applies(&self, resolution: Resolution) -> bool {
        resolution.finer().is_some()
    }

    fn resolve(
        &self,
        resolver: &Resolver,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError> {
        let Some(finer) = resolution.finer() else {
            return Ok(None);
        };
        let end = window_end(start, resolution);

        let rows = cx.buckets.get_buckets(cx.monitor_id, finer, start, end, SortOrder::Asc)?;
        let Some(newest) = rows.last().map(|b| b.start) else {
            return Ok(None);
        };
        let mut sum = Bucket::rollup(cx.monitor_id, resolution, start, &rows);

        if cx.now < end {
            let current = truncate_to_window(cx.now, finer);
            let mut key = window_end(newest, finer);
            while key <= current && key < end {
                if let Some((child, _)) = resolver.resolve_bucket(cx, finer, key)? {
                    sum.merge(&child);
                }
                key = window_end(key, finer);
            }
        }

        Ok(Some(sum))
    }
}

/// Folds non-late heartbeats from the event log.
pub struct RawEvents;

impl ResolveTier for RawEvents {
    fn tier(&self) -> Tier {
        Tier::RawEvents
    }

    fn resolve(
        &self,
        _resolver: &Resolver,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError> {
        let end = window_end(start, resolution);
        let heartbeats = cx.events.get_heartbeats(cx.monitor_id, start, end, SortOrder::Asc, None)?;

        let mut bucket = Bucket::empty(cx.monitor_id, resolution, start);
        for hb in heartbeats.iter().filter(|hb| !hb.late) {
            bucket.fold(hb);
        }
        Ok((!bucket.is_empty()).then_some(bucket))
    }
}

pub struct Resolver {
    tiers: Vec<Box<dyn ResolveTier>>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::with_tiers(vec![
            Box::new(FinalizedRow),
            Box::new(FinerAggregate),
            Box::new(RawEvents),
        ])
    }
}

impl Resolver {
    pub fn with_tiers(tiers: Vec<Box<dyn ResolveTier>>) -> Self {
        Self { tiers }
    }

    /// Reconcile one bucket. `Ok(None)` means no tier had data: UNKNOWN.
    pub fn resolve(
        &self,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Reconciled>, UptimeError> {
        let Some((bucket, tier)) = self.resolve_bucket(cx, resolution, start)? else {
            return Ok(None);
        };

        let end = window_end(start, resolution);
        let status = if cx.now < end {
            self.current_status(cx, &bucket, end)
        } else {
            bucket.status()
        };

        Ok(Some(Reconciled {
            bucket,
            tier,
            status,
        }))
    }

    /// Walk the applicable tiers in order. Errors only when every one of
    /// them failed.
    pub(crate) fn resolve_bucket(
        &self,
        cx: &ResolveContext<'_>,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<(Bucket, Tier)>, DbError> {
        let mut last_error = None;
        let mut attempted = 0;
        let mut failures = 0;

        for tier in self.tiers.iter().filter(|t| t.applies(resolution)) {
            attempted += 1;
            match tier.resolve(self, cx, resolution, start) {
                Ok(Some(bucket)) if !bucket.is_empty() => return Ok(Some((bucket, tier.tier()))),
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "Resolver: {} tier unavailable for monitor {} {} bucket at {}: {}",
                        tier.tier(),
                        cx.monitor_id,
                        resolution,
                        start,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == attempted => Err(e),
            _ => Ok(None),
        }
    }

    /// The newest heartbeat in an open window says what is happening now;
    /// the majority rule only applies when there is none.
    fn current_status(
        &self,
        cx: &ResolveContext<'_>,
        bucket: &Bucket,
        end: DateTime<Utc>,
    ) -> Status {
        match cx
            .events
            .get_heartbeats(cx.monitor_id, bucket.start, end, SortOrder::Desc, Some(1))
        {
            Ok(latest) => latest.first().map_or_else(|| bucket.status(), |hb| hb.status),
            Err(e) => {
                tracing::warn!(
                    "Resolver: latest heartbeat lookup failed for monitor {}: {}",
                    cx.monitor_id,
                    e
                );
                bucket.status()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Heartbeat, Store};
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    /// Storage that fails every call.
    struct BrokenStore;

    impl BucketStore for BrokenStore {
        fn insert_buckets(&self, _: &[Bucket]) -> Result<usize, DbError> {
            Err(DbError::LockPoisoned)
        }
        fn get_bucket(
            &self,
            _: i64,
            _: Resolution,
            _: DateTime<Utc>,
        ) -> Result<Option<Bucket>, DbError> {
            Err(DbError::LockPoisoned)
        }
        fn get_buckets(
            &self,
            _: i64,
            _: Resolution,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: SortOrder,
        ) -> Result<Vec<Bucket>, DbError> {
            Err(DbError::LockPoisoned)
        }
        fn delete_buckets_before(&self, _: Resolution, _: DateTime<Utc>) -> Result<usize, DbError> {
            Err(DbError::LockPoisoned)
        }
    }

    impl EventLog for BrokenStore {
        fn append_heartbeat(&self, _: &Heartbeat) -> Result<(), DbError> {
            Err(DbError::LockPoisoned)
        }
        fn get_heartbeats(
            &self,
            _: i64,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: SortOrder,
            _: Option<usize>,
        ) -> Result<Vec<Heartbeat>, DbError> {
            Err(DbError::LockPoisoned)
        }
        fn recent_heartbeats(&self, _: i64, _: usize) -> Result<Vec<Heartbeat>, DbError> {
            Err(DbError::LockPoisoned)
        }
        fn delete_heartbeats_before(&self, _: DateTime<Utc>) -> Result<usize, DbError> {
            Err(DbError::LockPoisoned)
        }
    }

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn counts(resolution: Resolution, start: DateTime<Utc>, up: u64, down: u64) -> Bucket {
        Bucket {
            up,
            down,
            weight: up + down,
            ..Bucket::empty(1, resolution, start)
        }
    }

    fn cx<'a>(
        buckets: &'a dyn BucketStore,
        events: &'a dyn EventLog,
        now: DateTime<Utc>,
    ) -> ResolveContext<'a> {
        ResolveContext {
            monitor_id: 1,
            buckets,
            events,
            now,
        }
    }

    #[test]
    fn test_finalized_row_wins() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store
            .insert_buckets(&[
                counts(Resolution::Day, day(), 10, 0),
                counts(Resolution::Hour, day(), 3, 5),
            ])
            .unwrap();

        let now = day() + Duration::days(3);
        let got = Resolver::default()
            .resolve(&cx(&store, &store, now), Resolution::Day, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::Finalized);
        assert_eq!((got.bucket.up, got.bucket.down), (10, 0));
        assert_eq!(got.status, Status::Up);
    }

    #[test]
    fn test_finer_rows_with_open_children() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let one = day() + Duration::hours(1);

        let mut rows = vec![counts(Resolution::Hour, day(), 60, 0)];
        rows.extend((0..29).map(|m| counts(Resolution::Minute, one + Duration::minutes(m), 1, 0)));
        store.insert_buckets(&rows).unwrap();
        store
            .append_heartbeat(&Heartbeat::new(1, one + Duration::minutes(29), Status::Up))
            .unwrap();

        let now = one + Duration::minutes(29) + Duration::seconds(30);
        let got = Resolver::default()
            .resolve(&cx(&store, &store, now), Resolution::Day, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::FinerAggregate);
        assert_eq!(got.bucket.up, 90);
        assert_eq!(got.status, Status::Up);
    }

    #[test]
    fn test_raw_events_exclude_late() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let hour = day() + Duration::hours(5);
        store.append_heartbeat(&Heartbeat::new(1, hour, Status::Up).with_ping(20.0)).unwrap();
        let mut late = Heartbeat::new(1, hour + Duration::seconds(10), Status::Down);
        late.late = true;
        store.append_heartbeat(&late).unwrap();

        let now = hour + Duration::hours(2);
        let got = Resolver::default()
            .resolve(&cx(&store, &store, now), Resolution::Hour, hour)
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::RawEvents);
        assert_eq!((got.bucket.up, got.bucket.down), (1, 0));
        assert_eq!(got.bucket.ping_avg, Some(20.0));
    }

    #[test]
    fn test_nothing_is_unknown() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let got = Resolver::default()
            .resolve(&cx(&store, &store, day()), Resolution::Day, day())
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_open_bucket_follows_latest_heartbeat() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        for i in 0..9 {
            store
                .append_heartbeat(&Heartbeat::new(1, day() + Duration::minutes(i), Status::Up))
                .unwrap();
        }
        store
            .append_heartbeat(&Heartbeat::new(1, day() + Duration::minutes(9), Status::Down))
            .unwrap();

        let now = day() + Duration::minutes(10);
        let got = Resolver::default()
            .resolve(&cx(&store, &store, now), Resolution::Hour, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.bucket.status(), Status::Up);
        assert_eq!(got.status, Status::Down);

        // Once the hour is over the majority decides.
        let later = day() + Duration::hours(2);
        let got = Resolver::default()
            .resolve(&cx(&store, &store, later), Resolution::Hour, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.status, Status::Up);
    }

    #[test]
    fn test_failed_tiers_fall_through() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append_heartbeat(&Heartbeat::new(1, day(), Status::Up)).unwrap();

        let now = day() + Duration::days(2);
        let got = Resolver::default()
            .resolve(&cx(&BrokenStore, &store, now), Resolution::Day, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::RawEvents);

        // Buckets broken and the log empty: just no data.
        let empty = NamedTempFile::new().unwrap();
        let empty = Store::new(empty.path()).unwrap();
        assert!(Resolver::default()
            .resolve(&cx(&BrokenStore, &empty, now), Resolution::Day, day())
            .unwrap()
            .is_none());

        let err = Resolver::default()
            .resolve(&cx(&BrokenStore, &BrokenStore, now), Resolution::Day, day())
            .unwrap_err();
        assert!(matches!(err, UptimeError::StorageFailure(_)));
    }

    #[test]
    fn test_minute_outage_is_an_error() {
        let now = day() + Duration::minutes(5);
        let err = Resolver::default()
            .resolve(&cx(&BrokenStore, &BrokenStore, now), Resolution::Minute, day())
            .unwrap_err();
        assert!(matches!(err, UptimeError::StorageFailure(_)));

        // Finer rows never apply to minutes, so the log alone still answers.
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append_heartbeat(&Heartbeat::new(1, day(), Status::Up)).unwrap();
        let got = Resolver::default()
            .resolve(&cx(&BrokenStore, &store, now), Resolution::Minute, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::RawEvents);
    }

    #[test]
    fn test_custom_tier_order() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store
            .insert_buckets(&[
                counts(Resolution::Day, day(), 10, 0),
                counts(Resolution::Hour, day(), 3, 5),
            ])
            .unwrap();

        let resolver = Resolver::with_tiers(vec![Box::new(FinerAggregate), Box::new(FinalizedRow)]);
        let got = resolver
            .resolve(&cx(&store, &store, day() + Duration::days(2)), Resolution::Day, day())
            .unwrap()
            .unwrap();
        assert_eq!(got.tier, Tier::FinerAggregate);
        assert_eq!(got.status, Status::Down);
    }
}
