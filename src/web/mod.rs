//! HTTP server module.
//!
//! Axum-based REST surface over the session lifecycle core, guarded by a
//! shared-secret header key.

pub mod auth;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::AppState;

/// Build the complete router with CORS on top of the API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::api_router(state).layer(cors)
}

/// Start the web server on the configured port. Returns after ctrl-c.
pub async fn start_server(state: Arc<AppState>) -> std::io::Result<()> {
    let port = state.config.port;
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
}
