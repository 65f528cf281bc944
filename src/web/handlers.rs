//! HTTP request handlers.

use super::AppState;
use crate::db::{Heartbeat, Resolution, Status};
use crate::uptime::{
    summarize, AggregationInfo, FixedWindow, Ingested, TimelinePoint, UptimeError, WindowUptime,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest `count` accepted by the data endpoint.
const MAX_DATA_POINTS: usize = 1440;

fn error_response(e: UptimeError) -> Response {
    let status = match &e {
        UptimeError::InvalidHeartbeat(_)
        | UptimeError::InvalidRange(_)
        | UptimeError::UnknownDuration(_) => StatusCode::BAD_REQUEST,
        UptimeError::StorageFailure(_) | UptimeError::Shutdown => {
            tracing::error!("API: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable").into_response();
        }
    };
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: Ingestion
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: Status,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ping: Option<f64>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub late: bool,
}

pub async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    let time = req.time.unwrap_or_else(|| state.registry.backend().clock.now());
    let heartbeat = Heartbeat {
        ping: req.ping,
        msg: req.msg,
        ..Heartbeat::new(id, time, req.status)
    };

    match state.registry.ingest(heartbeat).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                late: outcome == Ingested::Late,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Per-monitor queries
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UptimeQuery {
    pub duration: Option<String>,
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<UptimeQuery>,
) -> impl IntoResponse {
    match window_uptime(&state, id, query.duration.as_deref().unwrap_or("24h")).await {
        Ok(uptime) => Json(uptime).into_response(),
        Err(e) => error_response(e),
    }
}

async fn window_uptime(
    state: &AppState,
    id: i64,
    duration: &str,
) -> Result<WindowUptime, UptimeError> {
    let duration: FixedWindow = duration.parse()?;
    state.planner.fixed_window(id, duration).await
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    pub count: Option<usize>,
    pub resolution: Option<String>,
}

pub async fn handle_data(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<DataQuery>,
) -> impl IntoResponse {
    match data_points(&state, id, &query).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => error_response(e),
    }
}

async fn data_points(
    state: &AppState,
    id: i64,
    query: &DataQuery,
) -> Result<Vec<TimelinePoint>, UptimeError> {
    let resolution: Resolution = query
        .resolution
        .as_deref()
        .unwrap_or("minute")
        .parse()
        .map_err(|e| UptimeError::InvalidRange(format!("{}", e)))?;
    let count = query.count.unwrap_or(60);
    if count == 0 || count > MAX_DATA_POINTS {
        return Err(UptimeError::InvalidRange(format!(
            "count must be between 1 and {}",
            MAX_DATA_POINTS
        )));
    }
    state.planner.data_array(id, count, resolution).await
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    #[serde(default)]
    pub range_days: f64,
}

pub async fn handle_timeline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TimelineQuery>,
) -> impl IntoResponse {
    match state.planner.reconcile(id, query.range_days).await {
        Ok(timeline) => Json(timeline).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Status page
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub monitors: String,
    #[serde(default)]
    pub range_days: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHeartbeatResponse {
    pub heartbeat_list: HashMap<i64, Vec<TimelinePoint>>,
    pub uptime_list: HashMap<String, f64>,
    pub aggregation_info: HashMap<i64, AggregationInfo>,
}

fn parse_monitor_ids(list: &str) -> Result<Vec<i64>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| format!("invalid monitor id {:?}", s)))
        .collect()
}

pub async fn handle_status_heartbeat(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    let ids = match parse_monitor_ids(&query.monitors) {
        Ok(ids) => ids,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let mut response = StatusHeartbeatResponse {
        heartbeat_list: HashMap::new(),
        uptime_list: HashMap::new(),
        aggregation_info: HashMap::new(),
    };
    for id in ids {
        match state.planner.reconcile(id, query.range_days).await {
            Ok(timeline) => {
                response.uptime_list.insert(format!("{}_24", id), timeline.uptime);
                response.aggregation_info.insert(id, timeline.aggregation);
                response.heartbeat_list.insert(id, timeline.heartbeats);
            }
            Err(e) => return error_response(e),
        }
    }

    Json(response).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub monitors: String,
}

pub async fn handle_status_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    let ids = match parse_monitor_ids(&query.monitors) {
        Ok(ids) => ids,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    match summarize(&state.registry, &ids).await {
        Ok(status) => Json(serde_json::json!({ "status": status })).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Storage
// ============================================================================

pub async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    let monitors = state.registry.len().await;
    let stats = state.store.get_storage_stats().and_then(|stats| {
        let size = state.store.get_db_size_bytes()?;
        Ok(serde_json::json!({
            "storage": stats,
            "db_size_bytes": size,
            "active_monitors": monitors,
        }))
    });
    match stats {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(UptimeError::StorageFailure(e)),
    }
}
