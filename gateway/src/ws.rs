//! # WS Gateway
//!
//! Downstream WebSocket surface. One task per connected socket, exactly
//! the `ws_handler`/`handle_socket` split used by the rest of this
//! workspace's servers, generalized from a single fixed upstream to the
//! instrument/mode vocabulary the stream multiplexer understands.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Json;
use lib_common::error::GatewayError;
use lib_common::model::ApiKeyRecord;
use serde::Deserialize;
use serde_json::json;

use crate::broadcast::{ClientId, OutboundEvent};
use crate::metrics;
use crate::resolve::{check_blocklist, check_entitlement, enforce_rps, resolve_instruments, resolve_mode};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE_CYCLES: u32 = 2;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { instruments: Vec<String>, mode: Option<String> },
    Unsubscribe { instruments: Vec<String> },
    SetMode { instruments: Vec<String>, mode: String },
    GetQuote { instruments: Vec<String>, ltp_only: Option<bool> },
    GetHistoricalData { instrument: String, from_ts: i64, to_ts: i64 },
    Ping,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: axum::http::HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let api_key = query
        .api_key
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string));

    let Some(api_key) = api_key else {
        return error_response(axum::http::StatusCode::UNAUTHORIZED, GatewayError::AuthMissing);
    };

    let record = match state.usage.validate_api_key(&api_key).await {
        Ok(Some(record)) if record.is_active => record,
        Ok(_) => return error_response(axum::http::StatusCode::UNAUTHORIZED, GatewayError::AuthInvalid),
        Err(e) => {
            log::warn!("api key validation failed during ws connect: {e}");
            return error_response(axum::http::StatusCode::SERVICE_UNAVAILABLE, e);
        }
    };

    if let Some(flag) = state.abuse.status_for_api_key(&api_key).await {
        if flag.blocked {
            return error_response(
                axum::http::StatusCode::FORBIDDEN,
                GatewayError::KeyBlockedForAbuse { risk_score: flag.risk_score, reasons: flag.reason_codes },
            );
        }
    }

    let connection_limit = record.connection_limit;
    if let Err(e) = state.usage.track_ws_connection(&api_key, connection_limit).await {
        return error_response(axum::http::StatusCode::TOO_MANY_REQUESTS, e);
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, record, api_key, addr.ip().to_string()))
}

fn error_response(status: axum::http::StatusCode, err: GatewayError) -> axum::response::Response {
    (status, Json(json!({ "code": err.error_code(), "message": err.to_string() }))).into_response()
}

struct SocketState {
    client_id: ClientId,
    api_key: String,
    record: ApiKeyRecord,
    ip: String,
    subscribed: HashSet<u32>,
}

async fn handle_socket(socket: WebSocket, state: AppState, record: ApiKeyRecord, api_key: String, ip: String) {
    let client_id = state.registry.next_client_id();
    let mut rx = state.registry.register(client_id);

    state.audit.record_ws("connect", Some(api_key.clone()), Some(ip.clone()), None).await;
    metrics::record_ws_connection_opened();
    metrics::record_ws_event("connect");

    let mut socket_state = SocketState {
        client_id,
        api_key: api_key.clone(),
        record,
        ip: ip.clone(),
        subscribed: HashSet::new(),
    };

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut missed_pongs: u32 = 0;
    heartbeat.tick().await; // consume the immediate first tick

    let connected = serde_json::to_string(&OutboundEvent::Connected { client_id }).unwrap_or_default();
    if sender.send(Message::Text(connected.into())).await.is_err() {
        cleanup(&state, &socket_state).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_message(&state, &mut socket_state, &mut sender, &text).await {
                            log::debug!("ws message error for client {client_id}: {e}");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("ws receive error for client {client_id}: {e}");
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                missed_pongs += 1;
                if missed_pongs > PONG_GRACE_CYCLES {
                    log::info!("client {client_id} missed {missed_pongs} heartbeat cycles, terminating");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup(&state, &socket_state).await;
}

async fn cleanup(state: &AppState, socket_state: &SocketState) {
    let tokens: Vec<u32> = socket_state.subscribed.iter().copied().collect();
    state.multiplexer.unsubscribe_all(socket_state.client_id, &tokens).await;
    state.registry.unregister(socket_state.client_id);
    state.usage.untrack_ws_connection(&socket_state.api_key).await;
    state
        .audit
        .record_ws("disconnect", Some(socket_state.api_key.clone()), Some(socket_state.ip.clone()), None)
        .await;
    metrics::record_ws_connection_closed();
    metrics::record_ws_event("disconnect");
}

async fn handle_message(
    state: &AppState,
    socket_state: &mut SocketState,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    text: &str,
) -> Result<(), GatewayError> {
    let message: ClientMessage = serde_json::from_str(text).map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;

    let outcome = match message {
        ClientMessage::Subscribe { instruments, mode } => {
            handle_subscribe(state, socket_state, instruments, mode).await
        }
        ClientMessage::Unsubscribe { instruments } => handle_unsubscribe(state, socket_state, instruments).await,
        ClientMessage::SetMode { instruments, mode } => handle_set_mode(state, socket_state, instruments, mode).await,
        ClientMessage::GetQuote { instruments, ltp_only } => {
            handle_get_quote(state, socket_state, instruments, ltp_only.unwrap_or(false)).await
        }
        ClientMessage::GetHistoricalData { instrument, from_ts, to_ts } => {
            handle_get_historical(state, socket_state, instrument, from_ts, to_ts).await
        }
        ClientMessage::Ping => Ok(OutboundEvent::Pong { ts: chrono::Utc::now().timestamp_millis() }),
    };

    let event = match outcome {
        Ok(event) => event,
        Err(e) => OutboundEvent::Error {
            code: e.error_code(),
            message: e.to_string(),
            limit: None,
            retry_after_ms: match &e {
                GatewayError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
                _ => None,
            },
            risk_score: match &e {
                GatewayError::KeyBlockedForAbuse { risk_score, .. } => Some(*risk_score),
                _ => None,
            },
            reasons: match &e {
                GatewayError::KeyBlockedForAbuse { reasons, .. } => Some(reasons.clone()),
                _ => None,
            },
        },
    };

    let payload = serde_json::to_string(&event).map_err(GatewayError::Json)?;
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| GatewayError::StreamInactive)
}

async fn handle_subscribe(
    state: &AppState,
    socket_state: &mut SocketState,
    instruments: Vec<String>,
    mode: Option<String>,
) -> Result<OutboundEvent, GatewayError> {
    enforce_rps(state, &socket_state.api_key, "subscribe", state.config.ws_subscribe_rps, socket_state.record.ws_subscribe_rps).await?;
    let mode = resolve_mode(mode.as_deref())?;

    let resolved = resolve_instruments(state, &instruments).await?;
    let incoming_new = resolved.iter().filter(|(t, _)| !socket_state.subscribed.contains(t)).count();
    if socket_state.subscribed.len() + incoming_new > state.config.max_subscriptions_per_socket {
        return Err(GatewayError::InvalidPayload("max_subscriptions_per_socket exceeded".into()));
    }

    let mut tokens = Vec::with_capacity(resolved.len());
    for (token, exchange) in resolved {
        check_entitlement(&socket_state.record, exchange)?;
        check_blocklist(state, &socket_state.api_key, &socket_state.record.tenant_id, token, exchange).await?;
        tokens.push(token);
    }

    state.multiplexer.subscribe(&tokens, mode, socket_state.client_id).await;
    socket_state.subscribed.extend(tokens.iter().copied());
    metrics::record_ws_event("subscribe");
    state
        .audit
        .record_ws("subscribe", Some(socket_state.api_key.clone()), Some(socket_state.ip.clone()), Some(json!({ "count": tokens.len() })))
        .await;

    Ok(OutboundEvent::SubscriptionConfirmed { instruments, mode: mode.to_string() })
}

async fn handle_unsubscribe(
    state: &AppState,
    socket_state: &mut SocketState,
    instruments: Vec<String>,
) -> Result<OutboundEvent, GatewayError> {
    enforce_rps(state, &socket_state.api_key, "unsubscribe", state.config.ws_unsubscribe_rps, socket_state.record.ws_unsubscribe_rps).await?;

    let resolved = resolve_instruments(state, &instruments).await?;
    let tokens: Vec<u32> = resolved.into_iter().map(|(t, _)| t).collect();
    state.multiplexer.unsubscribe(&tokens, socket_state.client_id).await;
    for token in &tokens {
        socket_state.subscribed.remove(token);
    }
    metrics::record_ws_event("unsubscribe");
    state
        .audit
        .record_ws("unsubscribe", Some(socket_state.api_key.clone()), Some(socket_state.ip.clone()), Some(json!({ "count": tokens.len() })))
        .await;

    Ok(OutboundEvent::UnsubscriptionConfirmed { instruments })
}

async fn handle_set_mode(
    state: &AppState,
    socket_state: &mut SocketState,
    instruments: Vec<String>,
    mode: String,
) -> Result<OutboundEvent, GatewayError> {
    enforce_rps(state, &socket_state.api_key, "set_mode", state.config.ws_mode_rps, socket_state.record.ws_mode_rps).await?;
    let parsed_mode = resolve_mode(Some(&mode))?;

    let resolved = resolve_instruments(state, &instruments).await?;
    let mut tokens = Vec::with_capacity(resolved.len());
    for (token, exchange) in resolved {
        check_entitlement(&socket_state.record, exchange)?;
        check_blocklist(state, &socket_state.api_key, &socket_state.record.tenant_id, token, exchange).await?;
        tokens.push(token);
    }
    state.multiplexer.subscribe(&tokens, parsed_mode, socket_state.client_id).await;
    socket_state.subscribed.extend(tokens.iter().copied());
    metrics::record_ws_event("set_mode");

    Ok(OutboundEvent::ModeConfirmed { instruments, mode })
}

async fn handle_get_quote(
    state: &AppState,
    socket_state: &SocketState,
    instruments: Vec<String>,
    ltp_only: bool,
) -> Result<OutboundEvent, GatewayError> {
    let resolved = resolve_instruments(state, &instruments).await?;
    let mut tokens = Vec::with_capacity(resolved.len());
    for (token, exchange) in resolved {
        check_entitlement(&socket_state.record, exchange)?;
        check_blocklist(state, &socket_state.api_key, &socket_state.record.tenant_id, token, exchange).await?;
        tokens.push(token);
    }
    let provider = state.resolver.resolve_for_http(None, Some(&socket_state.record)).await;
    let endpoint = if ltp_only { lib_common::model::Endpoint::Ltp } else { lib_common::model::Endpoint::Quotes };
    let mut fields = state.batcher.request(endpoint, tokens, provider).await?;
    if ltp_only {
        fields.retain(|_, f| f.last_price.map(|p| p.is_finite() && p > 0.0).unwrap_or(false));
    }
    metrics::record_ws_event("get_quote");
    Ok(OutboundEvent::QuoteData { data: serde_json::to_value(fields).unwrap_or_default() })
}

async fn handle_get_historical(
    state: &AppState,
    socket_state: &SocketState,
    instrument: String,
    from_ts: i64,
    to_ts: i64,
) -> Result<OutboundEvent, GatewayError> {
    let resolved = resolve_instruments(state, std::slice::from_ref(&instrument)).await?;
    let (token, exchange) = *resolved.first().ok_or_else(|| GatewayError::InvalidPayload("missing instrument".into()))?;
    check_entitlement(&socket_state.record, exchange)?;
    check_blocklist(state, &socket_state.api_key, &socket_state.record.tenant_id, token, exchange).await?;
    let provider = state.resolver.resolve_for_http(None, Some(&socket_state.record)).await;
    let candles = state
        .queue
        .execute(lib_common::model::Endpoint::History, move || async move {
            provider.get_historical_data(token, from_ts, to_ts).await
        })
        .await?;
    metrics::record_ws_event("get_historical_data");
    Ok(OutboundEvent::HistoricalData { token, data: serde_json::to_value(candles).unwrap_or_default() })
}

use futures_util::{SinkExt, StreamExt};
