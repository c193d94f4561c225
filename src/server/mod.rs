mod handlers;
mod state;

pub use state::AppState;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/geocode", post(handlers::geocode_batch))
        .route("/api/geocode/single", get(handlers::geocode_single))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route("/api/cache", delete(handlers::cache_clear))
        .route("/api/cache/clean", post(handlers::cache_clean))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn start(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    eprintln!("  Lokalkarte geocoder listening on http://{}", addr);
    eprintln!("  Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
