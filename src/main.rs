//! uptrail - Uptime aggregation service
//!
//! Rolls monitor heartbeats up into minute, hour and day buckets and serves
//! uptime figures and status timelines over HTTP.

mod clock;
mod config;
mod db;
mod retention;
mod uptime;
mod web;

use clock::SystemClock;
use config::ServerConfig;
use db::Store;
use retention::RetentionManager;
use uptime::{Backend, CalculatorRegistry, RangePlanner, Resolver};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let clock = Arc::new(SystemClock);
    let backend = Backend {
        buckets: store.clone(),
        events: store.clone(),
        clock: clock.clone(),
        resolver: Arc::new(Resolver::default()),
        close_grace: chrono::Duration::seconds(cfg.close_grace_secs),
    };
    let registry = Arc::new(CalculatorRegistry::new(backend));
    let planner = Arc::new(RangePlanner::new(registry.clone(), cfg.query_concurrency));

    // Start retention
    let retention = RetentionManager::new(store.clone(), clock, cfg.keep_data_days);
    let retention_task = retention.start();

    // Start web server
    let server = Server::new(cfg, store, registry, planner);
    let result = server.start().await;

    retention.stop();
    if let Err(e) = retention_task.await {
        tracing::error!("RetentionManager: task failed: {}", e);
    }
    result
}
