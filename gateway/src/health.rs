//! # Health Surface
//!
//! `GET /health` is a liveness probe with no dependency checks; `/health/detailed`
//! additionally pings the relational store, the shared store, and the active
//! provider; `/health/metrics` renders the Prometheus exposition text owned by
//! [`crate::metrics::install`].

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

pub async fn health_detailed(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.ping().await.is_ok();
    let store_ok = match &state.store {
        Some(store) => store.get("health:probe").await.is_ok(),
        None => false,
    };
    let provider = state.resolver.resolve_for_ws().await;
    let provider_ok = provider.ping().await.is_ok();
    let stream_status = state.multiplexer.stream_status().await;
    let subscribed_instruments = state.multiplexer.subscribed_instrument_count().await;

    let healthy = db_ok && provider_ok;
    let status = if healthy { axum::http::StatusCode::OK } else { axum::http::StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "database": db_ok,
            "shared_store": store_ok,
            "active_provider": provider.name(),
            "provider_reachable": provider_ok,
            "stream_status": stream_status,
            "subscribed_instruments": subscribed_instruments,
        })),
    )
}

pub async fn health_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
