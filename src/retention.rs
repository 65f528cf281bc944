//! Retention manager for pruning old heartbeats and fine-grained buckets.

use crate::clock::Clock;
use crate::db::{BucketStore, EventLog, Resolution, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Minute buckets outlive the 24h window by a day.
const MINUTE_RETENTION_DAYS: i64 = 2;
/// Hour buckets cover the longest hybrid view.
const HOUR_RETENTION_DAYS: i64 = 61;

/// Deletes data past its retention period once a minute.
pub struct RetentionManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    keep_data_days: i64,
    stop: broadcast::Sender<()>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, keep_data_days: i64) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            clock,
            keep_data_days,
            stop,
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let keep_data_days = self.keep_data_days;
        let mut rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(store.as_ref(), keep_data_days, clock.now());
                    }
                }
            }
            tracing::info!("RetentionManager: stopped");
        })
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// Cutoffs for raw heartbeats and each bucket resolution. Day buckets are
/// never pruned.
fn cutoffs(
    keep_data_days: i64,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, [(Resolution, DateTime<Utc>); 2]) {
    (
        now - ChronoDuration::days(keep_data_days),
        [
            (Resolution::Minute, now - ChronoDuration::days(MINUTE_RETENTION_DAYS)),
            (Resolution::Hour, now - ChronoDuration::days(HOUR_RETENTION_DAYS)),
        ],
    )
}

fn process_retention<S: BucketStore + EventLog>(
    store: &S,
    keep_data_days: i64,
    now: DateTime<Utc>,
) {
    let (heartbeat_cutoff, bucket_cutoffs) = cutoffs(keep_data_days, now);

    match store.delete_heartbeats_before(heartbeat_cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: deleted {} heartbeats", n),
        Err(e) => tracing::error!("RetentionManager: Failed to delete heartbeats: {}", e),
    }

    for (resolution, cutoff) in bucket_cutoffs {
        match store.delete_buckets_before(resolution, cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::info!("RetentionManager: deleted {} {} buckets", n, resolution),
            Err(e) => tracing::error!(
                "RetentionManager: Failed to delete {} buckets: {}",
                resolution,
                e
            ),
        }
    }
}
