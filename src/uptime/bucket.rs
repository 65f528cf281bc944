//! Bucket arithmetic: window alignment, heartbeat folding, roll-up sums and
//! status derivation.

use crate::db::{Bucket, Heartbeat, Resolution, Status};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(resolution.window_seconds());
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// Start of the window `steps` windows before `key`.
pub fn steps_back(key: DateTime<Utc>, resolution: Resolution, steps: i64) -> DateTime<Utc> {
    key - ChronoDuration::seconds(resolution.window_seconds() * steps)
}

pub fn window_end(start: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
    start + ChronoDuration::seconds(resolution.window_seconds())
}

impl Bucket {
    /// Sum `children` into a new bucket at `resolution`/`start`.
    pub fn rollup<'a>(
        monitor_id: i64,
        resolution: Resolution,
        start: DateTime<Utc>,
        children: impl IntoIterator<Item = &'a Bucket>,
    ) -> Bucket {
        let mut parent = Bucket::empty(monitor_id, resolution, start);
        for child in children {
            parent.merge(child);
        }
        parent
    }

    pub fn end(&self) -> DateTime<Utc> {
        window_end(self.start, self.resolution)
    }

    pub fn is_empty(&self) -> bool {
        self.weight == 0
    }

    /// Count one heartbeat into this bucket.
    pub fn fold(&mut self, heartbeat: &Heartbeat) {
        match heartbeat.status {
            Status::Up => self.up += 1,
            Status::Down => self.down += 1,
            Status::Maintenance => self.maintenance += 1,
            Status::Pending | Status::Unknown => {}
        }
        self.weight += 1;

        if let Some(ping) = heartbeat.ping {
            self.ping_count += 1;
            let avg = self.ping_avg.unwrap_or(0.0);
            self.ping_avg = Some(avg + (ping - avg) / self.ping_count as f64);
            self.ping_min = Some(self.ping_min.map_or(ping, |m| m.min(ping)));
            self.ping_max = Some(self.ping_max.map_or(ping, |m| m.max(ping)));
        }
    }

    /// Add another bucket's counts, re-averaging latency by sample count.
    pub fn merge(&mut self, other: &Bucket) {
        self.up += other.up;
        self.down += other.down;
        self.maintenance += other.maintenance;
        self.weight += other.weight;

        if other.ping_count == 0 {
            return;
        }
        if self.ping_count == 0 {
            self.ping_avg = other.ping_avg;
            self.ping_min = other.ping_min;
            self.ping_max = other.ping_max;
            self.ping_count = other.ping_count;
            return;
        }

        let total = self.ping_count + other.ping_count;
        let a = self.ping_avg.unwrap_or(0.0);
        let b = other.ping_avg.unwrap_or(0.0);
        self.ping_avg = Some(a + (b - a) * other.ping_count as f64 / total as f64);
        self.ping_count = total;
        self.ping_min = min_opt(self.ping_min, other.ping_min);
        self.ping_max = max_opt(self.ping_max, other.ping_max);
    }

    /// Majority status of a finalized bucket.
    ///
    /// Maintenance wins outright; UP needs a strict majority, so any bucket
    /// where `down > up / 2` is DOWN.
    pub fn status(&self) -> Status {
        if self.maintenance > 0 {
            Status::Maintenance
        } else if 2 * self.down > self.up {
            Status::Down
        } else if self.up > 0 {
            Status::Up
        } else {
            Status::Pending
        }
    }

    /// `up / (up + down)`, or `None` without qualifying samples.
    pub fn uptime(&self) -> Option<f64> {
        let total = self.up + self.down;
        (total > 0).then(|| self.up as f64 / total as f64)
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counts(up: u64, down: u64, maintenance: u64) -> Bucket {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Bucket {
            up,
            down,
            maintenance,
            weight: up + down + maintenance,
            ..Bucket::empty(1, Resolution::Hour, start)
        }
    }

    #[test]
    fn test_truncate_to_window() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            truncate_to_window(dt, Resolution::Minute),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(
            truncate_to_window(dt, Resolution::Hour),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(
            truncate_to_window(dt, Resolution::Day),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_status_boundaries() {
        assert_eq!(counts(5, 5, 0).status(), Status::Down);
        assert_eq!(counts(7, 3, 0).status(), Status::Up);
        assert_eq!(counts(0, 0, 1).status(), Status::Maintenance);
        assert_eq!(counts(9, 9, 1).status(), Status::Maintenance);
        assert_eq!(counts(0, 1, 0).status(), Status::Down);
        assert_eq!(counts(0, 0, 0).status(), Status::Pending);
    }

    #[test]
    fn test_fold_incremental_mean() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut bucket = Bucket::empty(1, Resolution::Minute, start);
        let samples = [
            (Status::Up, Some(10.0)),
            (Status::Up, None),
            (Status::Down, Some(40.0)),
            (Status::Pending, Some(25.0)),
        ];
        for (status, ping) in samples {
            let mut hb = Heartbeat::new(1, start, status);
            hb.ping = ping;
            bucket.fold(&hb);
        }

        assert_eq!((bucket.up, bucket.down, bucket.maintenance, bucket.weight), (2, 1, 0, 4));
        assert_eq!(bucket.ping_count, 3);
        assert!((bucket.ping_avg.unwrap() - 25.0).abs() < 1e-9);
        assert_eq!(bucket.ping_min, Some(10.0));
        assert_eq!(bucket.ping_max, Some(40.0));
        assert_eq!(bucket.uptime(), Some(2.0 / 3.0));
    }

    #[test]
    fn test_merge_weights_latency() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = Bucket::empty(1, Resolution::Minute, start);
        a.fold(&Heartbeat::new(1, start, Status::Up).with_ping(10.0));
        let mut b = Bucket::empty(1, Resolution::Minute, start);
        for _ in 0..3 {
            b.fold(&Heartbeat::new(1, start, Status::Up).with_ping(50.0));
        }

        let parent = Bucket::rollup(1, Resolution::Hour, start, [&a, &b]);
        assert_eq!(parent.up, 4);
        assert_eq!(parent.ping_count, 4);
        assert!((parent.ping_avg.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(parent.ping_min, Some(10.0));

        let empty = Bucket::rollup(1, Resolution::Hour, start, std::iter::empty());
        assert!(empty.is_empty());
        assert_eq!(empty.uptime(), None);
    }
}
