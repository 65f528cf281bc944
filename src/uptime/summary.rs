//! Overall state across a set of monitors, as shown on a status badge.

use crate::db::Status;

use super::registry::CalculatorRegistry;
use super::UptimeError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    Up,
    Down,
    Degraded,
    Maintenance,
    #[serde(rename = "N/A")]
    NotAvailable,
}

/// Maintenance anywhere wins; otherwise all up is Up, a mix of up and down
/// is Degraded and only down is Down. PENDING and UNKNOWN are ignored.
pub fn overall_status(statuses: impl IntoIterator<Item = Status>) -> OverallStatus {
    let (mut up, mut down) = (false, false);
    for status in statuses {
        match status {
            Status::Maintenance => return OverallStatus::Maintenance,
            Status::Up => up = true,
            Status::Down => down = true,
            Status::Pending | Status::Unknown => {}
        }
    }
    match (up, down) {
        (true, false) => OverallStatus::Up,
        (true, true) => OverallStatus::Degraded,
        (false, true) => OverallStatus::Down,
        (false, false) => OverallStatus::NotAvailable,
    }
}

/// Overall state from each monitor's most recent heartbeat. Reads the
/// event log directly, so no calculator is loaded.
pub async fn summarize(
    registry: &CalculatorRegistry,
    monitor_ids: &[i64],
) -> Result<OverallStatus, UptimeError> {
    let events = &registry.backend().events;
    let mut statuses = Vec::with_capacity(monitor_ids.len());
    for &monitor_id in monitor_ids {
        if let Some(latest) = events.latest_heartbeat(monitor_id)? {
            statuses.push(latest.status);
        }
    }
    Ok(overall_status(statuses))
}
