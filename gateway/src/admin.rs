//! # Admin Control Plane
//!
//! Every handler here requires a matching `x-admin-token` header; there is
//! no per-tenant scoping because the admin surface is operated by the
//! gateway's own operators, not by api-key holders.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use lib_common::error::GatewayError;
use lib_common::model::ApiKeyRecord;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

fn require_admin(state: &AppState, headers: &axum::http::HeaderMap) -> Result<(), axum::response::Response> {
    let token = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
    if !state.config.admin_token.is_empty() && token == Some(state.config.admin_token.as_str()) {
        Ok(())
    } else {
        Err((axum::http::StatusCode::UNAUTHORIZED, Json(json!({ "code": "auth_invalid", "message": "missing or invalid admin token" }))).into_response())
    }
}

fn err_response(status: axum::http::StatusCode, err: impl std::fmt::Display) -> axum::response::Response {
    (status, Json(json!({ "message": err.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetGlobalProviderBody {
    pub provider: String,
}

pub async fn set_global_provider(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<SetGlobalProviderBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    state.resolver.set_global(&body.provider).await;
    Json(json!({ "provider": body.provider })).into_response()
}

pub async fn get_global_provider(State(state): State<AppState>, headers: axum::http::HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "provider": state.resolver.get_global().await })).into_response()
}

pub async fn start_stream(State(state): State<AppState>, headers: axum::http::HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.multiplexer.start_streaming().await {
        Ok(()) => Json(json!({ "status": state.multiplexer.stream_status().await })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

pub async fn stop_stream(State(state): State<AppState>, headers: axum::http::HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    state.multiplexer.stop_streaming().await;
    Json(json!({ "status": state.multiplexer.stream_status().await })).into_response()
}

pub async fn stream_status(State(state): State<AppState>, headers: axum::http::HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({
        "status": state.multiplexer.stream_status().await,
        "subscribed_instruments": state.multiplexer.subscribed_instrument_count().await,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    pub key: String,
    pub tenant_id: String,
    pub rate_limit_per_minute: u32,
    pub connection_limit: u32,
    pub ws_subscribe_rps: Option<u32>,
    pub ws_unsubscribe_rps: Option<u32>,
    pub ws_mode_rps: Option<u32>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<CreateApiKeyBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let record = ApiKeyRecord {
        key: body.key,
        tenant_id: body.tenant_id,
        is_active: true,
        provider_override: None,
        rate_limit_per_minute: body.rate_limit_per_minute,
        connection_limit: body.connection_limit,
        ws_subscribe_rps: body.ws_subscribe_rps,
        ws_unsubscribe_rps: body.ws_unsubscribe_rps,
        ws_mode_rps: body.ws_mode_rps,
        entitled_exchanges: None,
    };
    match state.db.upsert_api_key(&record).await {
        Ok(()) => (axum::http::StatusCode::CREATED, Json(json!({ "key": record.key }))).into_response(),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, GatewayError::Database(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateApiKeyLimitsBody {
    pub key: String,
    pub rate_limit_per_minute: Option<u32>,
    pub connection_limit: Option<u32>,
    pub ws_subscribe_rps: Option<u32>,
    pub ws_unsubscribe_rps: Option<u32>,
    pub ws_mode_rps: Option<u32>,
}

pub async fn update_api_key_limits(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<UpdateApiKeyLimitsBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let result = state
        .db
        .update_api_key_limits(
            &body.key,
            body.rate_limit_per_minute,
            body.connection_limit,
            body.ws_subscribe_rps,
            body.ws_unsubscribe_rps,
            body.ws_mode_rps,
        )
        .await;
    match result {
        Ok(true) => Json(json!({ "key": body.key, "updated": true })).into_response(),
        Ok(false) => err_response(axum::http::StatusCode::NOT_FOUND, "no such api key"),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, GatewayError::Database(e)),
    }
}

pub async fn get_api_key_usage(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Path(key): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let record = match state.db.get_api_key(&key).await {
        Ok(Some(record)) => record,
        Ok(None) => return err_response(axum::http::StatusCode::NOT_FOUND, "no such api key"),
        Err(e) => return err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, GatewayError::Database(e)),
    };
    let usage = state.usage.get_usage_report(&key).await;
    Json(json!({
        "key": record.key,
        "tenant_id": record.tenant_id,
        "is_active": record.is_active,
        "limits": {
            "rate_limit_per_minute": record.rate_limit_per_minute,
            "connection_limit": record.connection_limit,
            "ws_subscribe_rps": record.ws_subscribe_rps,
            "ws_unsubscribe_rps": record.ws_unsubscribe_rps,
            "ws_mode_rps": record.ws_mode_rps,
        },
        "entitled_exchanges": record.entitled_exchanges,
        "usage": usage,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetEntitlementsBody {
    #[serde(alias = "apiKey")]
    pub api_key: String,
    pub exchanges: Vec<String>,
}

pub async fn set_entitlements(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<SetEntitlementsBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let exchanges = if body.exchanges.is_empty() { None } else { Some(body.exchanges) };
    match state.db.set_entitled_exchanges(&body.api_key, exchanges).await {
        Ok(true) => Json(json!({ "api_key": body.api_key, "updated": true })).into_response(),
        Ok(false) => err_response(axum::http::StatusCode::NOT_FOUND, "no such api key"),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, GatewayError::Database(e)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BlocklistBody {
    pub tokens: Option<Vec<u32>>,
    pub exchanges: Option<Vec<String>>,
    #[serde(alias = "apiKey")]
    pub api_key: Option<String>,
    pub tenant_id: Option<String>,
    pub reason: Option<String>,
}

/// `sadd`s into the same `ws:block:*` sets `crate::resolve::check_blocklist`
/// reads, so a blocklist entry takes effect without any other coordination.
pub async fn set_blocklist(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<BlocklistBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let Some(store) = &state.store else {
        return err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, "shared store unavailable");
    };

    let mut added = 0usize;
    for token in body.tokens.into_iter().flatten() {
        if store.sadd("ws:block:tokens", &token.to_string()).await.is_ok() {
            added += 1;
        }
    }
    for exchange in body.exchanges.into_iter().flatten() {
        if store.sadd("ws:block:exchanges", &exchange).await.is_ok() {
            added += 1;
        }
    }
    if let Some(api_key) = &body.api_key {
        if store.sadd("ws:block:apikeys", api_key).await.is_ok() {
            added += 1;
        }
    }
    if let Some(tenant_id) = &body.tenant_id {
        if store.sadd("ws:block:tenants", tenant_id).await.is_ok() {
            added += 1;
        }
    }
    if let Some(api_key) = &body.api_key {
        let reason = body.reason.clone().unwrap_or_else(|| "admin_blocklist".to_string());
        if let Err(e) = state.abuse.block(api_key, &reason).await {
            log::warn!("failed to record sticky abuse block for {api_key}: {e}");
        }
    }
    Json(json!({ "entries_added": added })).into_response()
}

pub async fn list_abuse_flags(State(state): State<AppState>, headers: axum::http::HeaderMap) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.abuse.list_flags().await {
        Ok(flags) => Json(flags).into_response(),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AbuseKeyBody {
    #[serde(alias = "apiKey")]
    pub api_key: String,
    pub reason: Option<String>,
}

pub async fn block_abuse(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<AbuseKeyBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let reason = body.reason.unwrap_or_else(|| "manual_block".to_string());
    match state.abuse.block(&body.api_key, &reason).await {
        Ok(()) => Json(json!({ "api_key": body.api_key, "blocked": true })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

pub async fn unblock_abuse(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<AbuseKeyBody>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.abuse.unblock(&body.api_key).await {
        Ok(()) => Json(json!({ "api_key": body.api_key, "blocked": false })).into_response(),
        Err(e) => err_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

