//! HTTP transport for the RPC surface

pub mod health;
pub mod metrics;
pub mod rpc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::HealthResponse;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors_enabled = state.config.cors_enabled;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // /health and /metrics sit outside the interceptor pipeline
    let app = Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .route("/rpc/:service/:method", post(rpc::call))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_enabled {
        app.layer(cors)
    } else {
        app
    }
}
