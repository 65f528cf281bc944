//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("connection lock poisoned")]
    LockPoisoned,
}

/// Scan direction for range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Durable minute/hour/day aggregate rows keyed by (monitor, resolution, start).
pub trait BucketStore: Send + Sync {
    /// Insert closed buckets. Rows that already exist are left untouched;
    /// returns how many rows were newly written.
    fn insert_buckets(&self, buckets: &[Bucket]) -> Result<usize, DbError>;

    fn get_bucket(
        &self,
        monitor_id: i64,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError>;

    /// Buckets with `start <= time < end`.
    fn get_buckets(
        &self,
        monitor_id: i64,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: SortOrder,
    ) -> Result<Vec<Bucket>, DbError>;

    fn delete_buckets_before(
        &self,
        resolution: Resolution,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError>;
}

/// Append-only heartbeat log.
pub trait EventLog: Send + Sync {
    fn append_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), DbError>;

    /// Heartbeats with `start <= time < end`.
    fn get_heartbeats(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Heartbeat>, DbError>;

    /// The newest `limit` heartbeats, newest first.
    fn recent_heartbeats(&self, monitor_id: i64, limit: usize) -> Result<Vec<Heartbeat>, DbError>;

    fn latest_heartbeat(&self, monitor_id: i64) -> Result<Option<Heartbeat>, DbError> {
        Ok(self.recent_heartbeats(monitor_id, 1)?.into_iter().next())
    }

    fn delete_heartbeats_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const HEARTBEAT_COLUMNS: &str = "monitor_id, time, status, ping, msg, late";
const BUCKET_COLUMNS: &str = "monitor_id, window_seconds, time, up, down, maintenance, weight, \
     ping_avg, ping_count, ping_min, ping_max";

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // --- Status Page Stats ---

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    /// Get row counts per table and resolution.
    pub fn get_storage_stats(&self) -> Result<StorageStats, DbError> {
        let conn = self.conn()?;
        let heartbeats: i64 = conn.query_row("SELECT COUNT(*) FROM heartbeats", [], |r| r.get(0))?;
        let count_window = |resolution: Resolution| -> SqlResult<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM aggregates WHERE window_seconds = ?1",
                params![resolution.window_seconds()],
                |r| r.get(0),
            )
        };
        Ok(StorageStats {
            heartbeats,
            minute_buckets: count_window(Resolution::Minute)?,
            hour_buckets: count_window(Resolution::Hour)?,
            day_buckets: count_window(Resolution::Day)?,
        })
    }
}

impl BucketStore for Store {
    fn insert_buckets(&self, buckets: &[Bucket]) -> Result<usize, DbError> {
        if buckets.is_empty() {
            return Ok(0);
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                &format!(
                    "INSERT INTO aggregates ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(monitor_id, window_seconds, time) DO NOTHING",
                    BUCKET_COLUMNS
                ),
            )?;

            for b in buckets {
                inserted += stmt.execute(params![
                    b.monitor_id,
                    b.resolution.window_seconds(),
                    b.start.timestamp(),
                    b.up as i64,
                    b.down as i64,
                    b.maintenance as i64,
                    b.weight as i64,
                    b.ping_avg,
                    b.ping_count as i64,
                    b.ping_min,
                    b.ping_max,
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn get_bucket(
        &self,
        monitor_id: i64,
        resolution: Resolution,
        start: DateTime<Utc>,
    ) -> Result<Option<Bucket>, DbError> {
        let conn = self.conn()?;
        let bucket = conn
            .query_row(
                &format!(
                    "SELECT {} FROM aggregates
                     WHERE monitor_id = ?1 AND window_seconds = ?2 AND time = ?3",
                    BUCKET_COLUMNS
                ),
                params![monitor_id, resolution.window_seconds(), start.timestamp()],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    fn get_buckets(
        &self,
        monitor_id: i64,
        resolution: Resolution,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: SortOrder,
    ) -> Result<Vec<Bucket>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM aggregates
             WHERE monitor_id = ?1 AND window_seconds = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time {}",
            BUCKET_COLUMNS,
            order.as_sql()
        ))?;

        let buckets = stmt
            .query_map(
                params![
                    monitor_id,
                    resolution.window_seconds(),
                    start.timestamp(),
                    end.timestamp(),
                ],
                bucket_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(buckets)
    }

    fn delete_buckets_before(
        &self,
        resolution: Resolution,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM aggregates WHERE window_seconds = ?1 AND time < ?2",
            params![resolution.window_seconds(), cutoff.timestamp()],
        )?;
        Ok(deleted)
    }
}

impl EventLog for Store {
    fn append_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO heartbeats ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                HEARTBEAT_COLUMNS
            ),
            params![
                heartbeat.monitor_id,
                heartbeat.time.timestamp(),
                u8::from(heartbeat.status),
                heartbeat.ping,
                heartbeat.msg,
                heartbeat.late,
            ],
        )?;
        Ok(())
    }

    fn get_heartbeats(
        &self,
        monitor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Heartbeat>, DbError> {
        let conn = self.conn()?;
        // Equal timestamps keep insertion order.
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM heartbeats
             WHERE monitor_id = ?1 AND time >= ?2 AND time < ?3
             ORDER BY time {dir}, id {dir} LIMIT ?4",
            HEARTBEAT_COLUMNS,
            dir = order.as_sql()
        ))?;

        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let heartbeats = stmt
            .query_map(
                params![monitor_id, start.timestamp(), end.timestamp(), limit],
                heartbeat_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(heartbeats)
    }

    fn recent_heartbeats(&self, monitor_id: i64, limit: usize) -> Result<Vec<Heartbeat>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM heartbeats WHERE monitor_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
            HEARTBEAT_COLUMNS
        ))?;

        let heartbeats = stmt
            .query_map(params![monitor_id, limit as i64], heartbeat_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(heartbeats)
    }

    fn delete_heartbeats_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM heartbeats WHERE time < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(deleted)
    }
}

fn conversion_error(idx: usize, ty: Type, err: FieldError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| conversion_error(idx, Type::Integer, FieldError::Timestamp(secs)))
}

fn count_column(row: &Row<'_>, idx: usize, name: &'static str) -> SqlResult<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| conversion_error(idx, Type::Integer, FieldError::Count(name)))
}

fn heartbeat_from_row(row: &Row<'_>) -> SqlResult<Heartbeat> {
    let code: u8 = row.get(2)?;
    let status = match Status::try_from(code) {
        Ok(Status::Unknown) | Err(_) => {
            return Err(conversion_error(2, Type::Integer, FieldError::Status(code)))
        }
        Ok(status) => status,
    };

    Ok(Heartbeat {
        monitor_id: row.get(0)?,
        time: time_column(row, 1)?,
        status,
        ping: row.get(3)?,
        msg: row.get(4)?,
        late: row.get(5)?,
    })
}

fn bucket_from_row(row: &Row<'_>) -> SqlResult<Bucket> {
    let window_seconds: i64 = row.get(1)?;
    let resolution = Resolution::from_window_seconds(window_seconds).ok_or_else(|| {
        conversion_error(
            1,
            Type::Integer,
            FieldError::Resolution(window_seconds.to_string()),
        )
    })?;

    Ok(Bucket {
        monitor_id: row.get(0)?,
        resolution,
        start: time_column(row, 2)?,
        up: count_column(row, 3, "up")?,
        down: count_column(row, 4, "down")?,
        maintenance: count_column(row, 5, "maintenance")?,
        weight: count_column(row, 6, "weight")?,
        ping_avg: row.get(7)?,
        ping_count: count_column(row, 8, "ping_count")?,
        ping_min: row.get(9)?,
        ping_max: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn minute_bucket(monitor_id: i64, start: DateTime<Utc>, up: u64) -> Bucket {
        Bucket {
            up,
            weight: up,
            ..Bucket::empty(monitor_id, Resolution::Minute, start)
        }
    }

    #[test]
    fn test_bucket_insert_is_immutable() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap();

        assert_eq!(store.insert_buckets(&[minute_bucket(1, start, 3)]).unwrap(), 1);
        // Second write for the same key is ignored.
        assert_eq!(store.insert_buckets(&[minute_bucket(1, start, 9)]).unwrap(), 0);

        let fetched = store.get_bucket(1, Resolution::Minute, start).unwrap().unwrap();
        assert_eq!(fetched.up, 3);
        assert!(store.get_bucket(1, Resolution::Hour, start).unwrap().is_none());
        assert!(store.get_bucket(2, Resolution::Minute, start).unwrap().is_none());
    }

    #[test]
    fn test_bucket_range_scan() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let buckets: Vec<_> = (0..5)
            .map(|i| minute_bucket(1, base + Duration::minutes(i), i as u64))
            .collect();
        store.insert_buckets(&buckets).unwrap();

        let asc = store
            .get_buckets(
                1,
                Resolution::Minute,
                base + Duration::minutes(1),
                base + Duration::minutes(4),
                SortOrder::Asc,
            )
            .unwrap();
        assert_eq!(asc.iter().map(|b| b.up).collect::<Vec<_>>(), vec![1, 2, 3]);

        let desc = store
            .get_buckets(1, Resolution::Minute, base, base + Duration::minutes(5), SortOrder::Desc)
            .unwrap();
        assert_eq!(desc.first().unwrap().up, 4);

        assert_eq!(
            store.delete_buckets_before(Resolution::Minute, base + Duration::minutes(2)).unwrap(),
            2
        );
    }

    #[test]
    fn test_heartbeat_log() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        for i in 0..3 {
            let hb =
                Heartbeat::new(7, base + Duration::seconds(i * 20), Status::Up).with_ping(10.0);
            store.append_heartbeat(&hb).unwrap();
        }
        let mut late = Heartbeat::new(7, base, Status::Down).with_msg("timeout");
        late.late = true;
        store.append_heartbeat(&late).unwrap();

        let all = store
            .get_heartbeats(7, base, base + Duration::minutes(1), SortOrder::Asc, None)
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().any(|h| h.late && h.msg.as_deref() == Some("timeout")));

        let latest = store.latest_heartbeat(7).unwrap().unwrap();
        assert_eq!(latest.time, base + Duration::seconds(40));
        assert!(store.latest_heartbeat(8).unwrap().is_none());

        let limited = store
            .get_heartbeats(7, base, base + Duration::minutes(1), SortOrder::Desc, Some(2))
            .unwrap();
        assert_eq!(limited.len(), 2);

        assert_eq!(store.delete_heartbeats_before(base + Duration::seconds(1)).unwrap(), 2);
    }

    #[test]
    fn test_storage_stats() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        store.insert_buckets(&[minute_bucket(1, base, 1)]).unwrap();

        let stats = store.get_storage_stats().unwrap();
        assert_eq!(stats.minute_buckets, 1);
        assert_eq!(stats.hour_buckets, 0);
        assert_eq!(stats.heartbeats, 0);
        assert!(store.get_db_size_bytes().unwrap() > 0);
    }
}
