//! Inspection endpoints: health, metrics snapshot, cache stats and clear.
//! Clearing a single domain also resets its throttle state, so an operator
//! can recover a domain in one call.
//!
//! These sit outside the secure-key gate and are intended for the
//! localhost bind.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::proxy::server::AppState;

pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok"
    }))
    .into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.monitor.snapshot()).into_response()
}

pub async fn cache_stats(State(state): State<AppState>) -> Response {
    match state.cache.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!("cache stats failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn clear_cache(State(state): State<AppState>) -> Response {
    match state.cache.clear(None) {
        Ok(cleared) => Json(serde_json::json!({ "cleared": cleared })).into_response(),
        Err(e) => {
            tracing::error!("cache clear failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn clear_cache_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Response {
    if !state.config.domain_mappings.contains_key(&domain) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown domain alias '{domain}'") })),
        )
            .into_response();
    }
    match state.cache.clear(Some(domain.as_str())) {
        Ok(cleared) => {
            state.throttle.reset(&domain);
            Json(serde_json::json!({ "cleared": cleared })).into_response()
        }
        Err(e) => {
            tracing::error!("cache clear for {} failed: {}", domain, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
