//! Registry of per-monitor calculators.

use crate::db::{Heartbeat, Resolution, SortOrder};

use super::calculator::{Backend, UptimeCalculator, DAY_WINDOW};
use super::rollup::Ingested;
use super::UptimeError;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

type Slot = Arc<OnceCell<Arc<UptimeCalculator>>>;

/// Hands out one calculator per monitor, hydrating it on first use.
pub struct CalculatorRegistry {
    backend: Backend,
    calculators: RwLock<HashMap<i64, Slot>>,
}

impl CalculatorRegistry {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            calculators: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The calculator for `monitor_id`. Concurrent first calls share a
    /// single hydration; a failed hydration is retried by the next caller.
    pub async fn get(&self, monitor_id: i64) -> Result<Arc<UptimeCalculator>, UptimeError> {
        let slot = self.slot(monitor_id).await;
        let calculator = slot
            .get_or_try_init(|| async {
                UptimeCalculator::hydrate(monitor_id, self.backend.clone()).map(Arc::new)
            })
            .await?;
        Ok(calculator.clone())
    }

    /// Like [`get`](Self::get), but only monitors with stored history or
    /// an already loaded calculator get one. Read paths use this so that
    /// arbitrary ids from a query string do not pin calculators in memory.
    pub async fn lookup(
        &self,
        monitor_id: i64,
    ) -> Result<Option<Arc<UptimeCalculator>>, UptimeError> {
        let loaded = self
            .calculators
            .read()
            .await
            .get(&monitor_id)
            .and_then(|slot| slot.get().cloned());
        if loaded.is_some() {
            return Ok(loaded);
        }
        if !self.has_history(monitor_id)? {
            return Ok(None);
        }
        self.get(monitor_id).await.map(Some)
    }

    fn has_history(&self, monitor_id: i64) -> Result<bool, UptimeError> {
        if self.backend.events.latest_heartbeat(monitor_id)?.is_some() {
            return Ok(true);
        }
        let now = self.backend.clock.now();
        let days = self.backend.buckets.get_buckets(
            monitor_id,
            Resolution::Day,
            now - ChronoDuration::days(DAY_WINDOW as i64),
            now + ChronoDuration::days(1),
            SortOrder::Desc,
        )?;
        Ok(!days.is_empty())
    }

    async fn slot(&self, monitor_id: i64) -> Slot {
        if let Some(slot) = self.calculators.read().await.get(&monitor_id) {
            return slot.clone();
        }
        self.calculators
            .write()
            .await
            .entry(monitor_id)
            .or_default()
            .clone()
    }

    /// Record a heartbeat for its monitor.
    pub async fn ingest(&self, heartbeat: Heartbeat) -> Result<Ingested, UptimeError> {
        let calculator = self.get(heartbeat.monitor_id).await?;
        calculator.update(heartbeat).inspect_err(|e| {
            tracing::warn!("Registry: rejected heartbeat: {}", e);
        })
    }

    pub async fn len(&self) -> usize {
        self.calculators.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{Status, Store};
    use crate::uptime::{FixedWindow, Resolver};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn registry(tmp: &NamedTempFile) -> Arc<CalculatorRegistry> {
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        Arc::new(CalculatorRegistry::new(Backend {
            buckets: store.clone(),
            events: store,
            clock,
            resolver: Arc::new(Resolver::default()),
            close_grace: ChronoDuration::seconds(60),
        }))
    }

    #[tokio::test]
    async fn test_single_construction_under_concurrency() {
        let tmp = NamedTempFile::new().unwrap();
        let registry = registry(&tmp);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get(7).await.unwrap() })
            })
            .collect();

        let mut calculators = Vec::new();
        for handle in handles {
            calculators.push(handle.await.unwrap());
        }
        assert!(calculators.iter().all(|c| Arc::ptr_eq(c, &calculators[0])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_monitors_are_isolated() {
        let tmp = NamedTempFile::new().unwrap();
        let registry = registry(&tmp);
        let now = registry.backend().clock.now();

        registry.ingest(Heartbeat::new(1, now, Status::Up)).await.unwrap();
        registry.ingest(Heartbeat::new(2, now, Status::Down)).await.unwrap();

        let one = registry.get(1).await.unwrap();
        let two = registry.get(2).await.unwrap();
        assert_eq!(one.monitor_id(), 1);
        assert_eq!(one.fixed_window_uptime(FixedWindow::Day).unwrap().uptime, 1.0);
        assert_eq!(two.fixed_window_uptime(FixedWindow::Day).unwrap().uptime, 0.0);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_lookup_skips_unknown_monitors() {
        let tmp = NamedTempFile::new().unwrap();
        let registry = registry(&tmp);
        let now = registry.backend().clock.now();

        for id in 1000..1100 {
            assert!(registry.lookup(id).await.unwrap().is_none());
        }
        assert_eq!(registry.len().await, 0);

        registry
            .backend()
            .events
            .append_heartbeat(&Heartbeat::new(5, now, Status::Up))
            .unwrap();
        let found = registry.lookup(5).await.unwrap().unwrap();
        assert_eq!(found.monitor_id(), 5);
        assert!(Arc::ptr_eq(&found, &registry.lookup(5).await.unwrap().unwrap()));
        assert_eq!(registry.len().await, 1);
    }

    #[test]
    fn test_ingest_rejects_invalid() {
        let tmp = NamedTempFile::new().unwrap();
        let registry = registry(&tmp);
        let future = registry.backend().clock.now() + ChronoDuration::days(1);
        let result = tokio_test::block_on(registry.ingest(Heartbeat::new(3, future, Status::Up)));
        assert!(matches!(result, Err(UptimeError::InvalidHeartbeat(_))));
    }
}
