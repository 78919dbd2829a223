//! Error taxonomy shared by every layer of the gateway.
//!
//! Variants map 1:1 onto the wire error codes sent to WebSocket clients and
//! the HTTP status codes returned by the REST surface; `error_code()` is the
//! canonical string used in both places.

use thiserror::Error;

/// The single error type propagated out of the core engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing api key")]
    AuthMissing,

    #[error("invalid api key")]
    AuthInvalid,

    #[error("api key blocked for abuse (risk_score={risk_score})")]
    KeyBlockedForAbuse {
        risk_score: f64,
        reasons: Vec<String>,
    },

    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid exchange: {0}")]
    InvalidExchange(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("stream inactive")]
    StreamInactive,

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("entitlement denied for exchange {0}")]
    EntitlementDenied(String),

    #[error("provider error: {message}")]
    ProviderError { message: String, retryable: bool },

    #[error("backpressure drop")]
    BackpressureDrop,

    #[error("shared store error: {0}")]
    Store(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl GatewayError {
    /// The wire code sent in WS `error` frames and logged in audit rows.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing => "auth_missing",
            GatewayError::AuthInvalid => "auth_invalid",
            GatewayError::KeyBlockedForAbuse { .. } => "key_blocked_for_abuse",
            GatewayError::ConnectionLimitExceeded => "connection_limit_exceeded",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::RateLimitExceeded => "rate_limit_exceeded",
            GatewayError::InvalidPayload(_) => "invalid_payload",
            GatewayError::InvalidExchange(_) => "invalid_exchange",
            GatewayError::InvalidMode(_) => "invalid_mode",
            GatewayError::UnknownEvent(_) => "unknown_event",
            GatewayError::StreamInactive => "stream_inactive",
            GatewayError::SubscriptionNotFound => "subscription_not_found",
            GatewayError::EntitlementDenied(_) => "entitlement_denied",
            GatewayError::ProviderError { .. } => "provider_error",
            GatewayError::BackpressureDrop => "backpressure_drop",
            GatewayError::Store(_) => "store_error",
            GatewayError::Http(_) => "provider_error",
            GatewayError::WebSocket(_) => "provider_error",
            GatewayError::Json(_) => "invalid_payload",
            GatewayError::Database(_) => "store_error",
            GatewayError::Redis(_) => "store_error",
        }
    }

    /// Whether this variant represents a fail-open infrastructure hiccup
    /// rather than a caller-visible rejection.
    pub fn is_infra(&self) -> bool {
        matches!(
            self,
            GatewayError::Store(_) | GatewayError::Database(_) | GatewayError::Redis(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
