//! Watchpost server entrypoint.

use watchpost::blackout::{BlackoutCoordinator, ResumeWatchdog};
use watchpost::broadcast::Broadcaster;
use watchpost::config::ServerConfig;
use watchpost::db::Store;
use watchpost::queue::{DetectionSink, QueueWorker, RetryQueue};
use watchpost::registry::{HeartbeatMonitor, Registry};
use watchpost::web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("watchpost=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Watchpost on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Wire up services
    let broadcaster = Arc::new(Broadcaster::new());
    let registry = Arc::new(Registry::new(store.clone(), broadcaster.clone()));
    let sink = Arc::new(DetectionSink::new(store.clone()));
    let retry_queue = Arc::new(RetryQueue::new(
        store.clone(),
        sink,
        cfg.max_retries,
        Duration::from_secs(cfg.base_retry_delay_secs),
    ));
    let coordinator = Arc::new(BlackoutCoordinator::new(store.clone(), broadcaster.clone()));

    // Start background sweeps
    let queue_worker = QueueWorker::new(store.clone(), retry_queue.clone());
    queue_worker.start();

    let watchdog = ResumeWatchdog::new(
        coordinator.clone(),
        Duration::from_secs(cfg.resume_timeout_secs),
    );
    watchdog.start();

    let heartbeat_monitor = HeartbeatMonitor::new(
        registry.clone(),
        Duration::from_secs(cfg.heartbeat_stale_secs),
    );
    heartbeat_monitor.start();

    // Start web server
    let server = Server::new(
        cfg,
        store,
        registry,
        retry_queue,
        coordinator,
        broadcaster,
    );
    server.start().await?;

    Ok(())
}
