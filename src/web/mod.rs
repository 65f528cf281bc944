//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::uptime::{CalculatorRegistry, RangePlanner};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<CalculatorRegistry>,
    pub planner: Arc<RangePlanner>,
}

/// Web server for uptrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        registry: Arc<CalculatorRegistry>,
        planner: Arc<RangePlanner>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                registry,
                planner,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Ingestion
        .route("/api/monitors/{id}/heartbeats", post(handlers::handle_ingest))
        // Per-monitor queries
        .route("/api/monitors/{id}/uptime", get(handlers::handle_uptime))
        .route("/api/monitors/{id}/data", get(handlers::handle_data))
        .route("/api/monitors/{id}/timeline", get(handlers::handle_timeline))
        // Status page
        .route("/api/status/heartbeat", get(handlers::handle_status_heartbeat))
        .route("/api/status/summary", get(handlers::handle_status_summary))
        .route("/api/stats", get(handlers::handle_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
