//! Web server module.

mod handlers;
mod ws;

pub use handlers::*;

use crate::blackout::BlackoutCoordinator;
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::queue::RetryQueue;
use crate::registry::Registry;

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
    pub registry: Arc<Registry>,
    pub queue: Arc<RetryQueue>,
    pub blackout: Arc<BlackoutCoordinator>,
    pub broadcaster: Arc<Broadcaster>,
}

/// Web server for Watchpost.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        registry: Arc<Registry>,
        queue: Arc<RetryQueue>,
        blackout: Arc<BlackoutCoordinator>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                registry,
                queue,
                blackout,
                broadcaster,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Health
            .route("/health", get(handlers::handle_health))
            // Nodes
            .route("/api/nodes/register", post(handlers::handle_register_node))
            .route("/api/nodes", get(handlers::handle_get_nodes))
            .route("/api/nodes/{node_id}/heartbeat", post(handlers::handle_heartbeat))
            .route("/api/nodes/{node_id}/status", get(handlers::handle_node_status))
            .route("/api/nodes/{node_id}/queue", get(handlers::handle_node_queue))
            // Blackout
            .route("/api/nodes/{node_id}/blackout", get(handlers::handle_blackout_status))
            .route(
                "/api/nodes/{node_id}/blackout/activate",
                post(handlers::handle_activate_blackout),
            )
            .route(
                "/api/nodes/{node_id}/blackout/deactivate",
                post(handlers::handle_deactivate_blackout),
            )
            .route(
                "/api/nodes/{node_id}/blackout/complete",
                post(handlers::handle_complete_blackout),
            )
            // Detections
            .route("/api/detections", post(handlers::handle_create_detection))
            .route("/api/detections", get(handlers::handle_get_detections))
            .route("/api/detections/batch", post(handlers::handle_batch_detections))
            // Queue
            .route("/api/queue/stats", get(handlers::handle_queue_stats))
            // Live updates
            .route("/ws", get(ws::handle_ws))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4MB, batches can be large
            .with_state(self.state.clone())
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
