//! # Client REST Surface
//!
//! `GET /quote`, `GET /ltp`, `GET /ohlc`, authenticated the same way as the
//! WS handshake (`x-api-key` header or `api_key` query) and going through
//! the same entitlement/blocklist/abuse checks before reaching the request
//! batcher, so a caller gets identical treatment regardless of which
//! surface it uses.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use lib_common::error::GatewayError;
use lib_common::model::Endpoint;
use serde::Deserialize;
use serde_json::json;

use crate::resolve::{check_blocklist, check_entitlement, parse_pairs_strict, resolve_instruments};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub instruments: String,
    pub api_key: Option<String>,
}

fn error_status(err: &GatewayError) -> axum::http::StatusCode {
    match err {
        GatewayError::AuthMissing | GatewayError::AuthInvalid => axum::http::StatusCode::UNAUTHORIZED,
        GatewayError::KeyBlockedForAbuse { .. } | GatewayError::EntitlementDenied(_) => axum::http::StatusCode::FORBIDDEN,
        GatewayError::RateLimitExceeded => axum::http::StatusCode::TOO_MANY_REQUESTS,
        GatewayError::InvalidPayload(_) | GatewayError::InvalidExchange(_) | GatewayError::InvalidMode(_) => {
            axum::http::StatusCode::BAD_REQUEST
        }
        _ => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: GatewayError) -> axum::response::Response {
    let status = error_status(&err);
    (status, Json(json!({ "code": err.error_code(), "message": err.to_string() }))).into_response()
}

async fn handle(
    state: AppState,
    headers: axum::http::HeaderMap,
    query: QuoteQuery,
    endpoint: Endpoint,
    route: &'static str,
) -> axum::response::Response {
    let start = Instant::now();
    let api_key = query
        .api_key
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string));
    let ip = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string);
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);

    let Some(api_key) = api_key else {
        return error_response(GatewayError::AuthMissing);
    };

    match handle_inner(&state, &headers, &api_key, &query.instruments, endpoint).await {
        Ok(body) => {
            state
                .audit
                .record_http(route, "GET", 200, Some(api_key), ip, user_agent, start.elapsed().as_millis() as u64)
                .await;
            (axum::http::StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            let status = error_status(&e);
            state
                .audit
                .record_http(route, "GET", status.as_u16(), Some(api_key), ip, user_agent, start.elapsed().as_millis() as u64)
                .await;
            error_response(e)
        }
    }
}

async fn handle_inner(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    api_key: &str,
    instruments_raw: &str,
    endpoint: Endpoint,
) -> Result<serde_json::Value, GatewayError> {
    let record = match state.usage.validate_api_key(api_key).await {
        Ok(Some(record)) if record.is_active => record,
        Ok(_) => return Err(GatewayError::AuthInvalid),
        Err(e) => return Err(e),
    };

    if let Some(flag) = state.abuse.status_for_api_key(api_key).await {
        if flag.blocked {
            return Err(GatewayError::KeyBlockedForAbuse { risk_score: flag.risk_score, reasons: flag.reason_codes });
        }
    }

    state.usage.increment_http_usage(api_key, record.rate_limit_per_minute).await?;

    let instruments: Vec<String> = instruments_raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    if instruments.is_empty() {
        return Err(GatewayError::InvalidPayload("instruments must not be empty".into()));
    }

    let header_override = headers.get("x-provider").and_then(|v| v.to_str().ok());
    let provider = state.resolver.resolve_for_http(header_override, Some(&record)).await;

    // LTP requested by `EXCHANGE-TOKEN` pairs (rather than bare tokens) goes
    // through the pair-coalescing batcher path, which always returns an
    // entry per requested pair instead of silently dropping unknown ones.
    if endpoint == Endpoint::Ltp && instruments.iter().all(|i| i.contains('-')) {
        let pairs = parse_pairs_strict(&instruments)?;
        for pair in &pairs {
            check_entitlement(&record, pair.exchange)?;
            check_blocklist(state, api_key, &record.tenant_id, pair.token, pair.exchange).await?;
        }
        let by_pair = state.batcher.request_ltp_by_pairs(pairs, provider).await?;
        let out: HashMap<String, serde_json::Value> = by_pair
            .into_iter()
            .map(|(pair, price)| (pair.to_string(), json!({ "last_price": price })))
            .collect();
        return serde_json::to_value(out).map_err(GatewayError::Json);
    }

    let resolved = resolve_instruments(state, &instruments).await?;
    let mut tokens = Vec::with_capacity(resolved.len());
    for (token, exchange) in resolved {
        check_entitlement(&record, exchange)?;
        check_blocklist(state, api_key, &record.tenant_id, token, exchange).await?;
        tokens.push(token);
    }

    let mut fields = state.batcher.request(endpoint, tokens, provider).await?;
    if endpoint == Endpoint::Ltp {
        fields.retain(|_, f| f.last_price.map(|p| p.is_finite() && p > 0.0).unwrap_or(false));
    }
    serde_json::to_value(fields).map_err(GatewayError::Json)
}

pub async fn get_quote(State(state): State<AppState>, headers: axum::http::HeaderMap, Query(query): Query<QuoteQuery>) -> axum::response::Response {
    handle(state, headers, query, Endpoint::Quotes, "/quote").await
}

pub async fn get_ltp(State(state): State<AppState>, headers: axum::http::HeaderMap, Query(query): Query<QuoteQuery>) -> axum::response::Response {
    handle(state, headers, query, Endpoint::Ltp, "/ltp").await
}

pub async fn get_ohlc(State(state): State<AppState>, headers: axum::http::HeaderMap, Query(query): Query<QuoteQuery>) -> axum::response::Response {
    handle(state, headers, query, Endpoint::Ohlc, "/ohlc").await
}
