//! Prometheus metrics endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.config.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let rate_limit_keys = state
        .rate_limit
        .is_enabled()
        .then(|| state.rate_limit.tracked_keys() as u64);
    let body = state.metrics.render(state.uptime_secs(), rate_limit_keys);

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
