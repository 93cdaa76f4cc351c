//! # filerocket server
//!
//! HTTP surface of the relay:
//!
//! - `GET /ws` upgrades to the signaling channel
//! - `GET /api/download/{code}` and `GET /download?pickupCode=` open the
//!   receiver's download stream
//! - `GET /health` reports liveness and the number of active sessions

pub mod error;
pub mod routes;
pub mod security_headers;
pub mod ws;

use axum::routing::get;
use axum::{middleware, Router};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use filerocket_relay_core::config::ServerSettings;
use filerocket_relay_core::RelayCoordinator;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: RelayCoordinator,
    /// Largest signaling frame accepted from a client
    pub max_message_bytes: usize,
}

impl AppState {
    pub fn new(coordinator: RelayCoordinator, settings: &ServerSettings) -> Self {
        Self {
            coordinator,
            max_message_bytes: settings.max_message_bytes,
        }
    }
}

/// Create the relay router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/download/:code", get(routes::download_by_path))
        .route("/download", get(routes::download_by_query))
        .route("/health", get(routes::health))
        .layer(middleware::from_fn(security_headers::security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
