//! Data model shared by the provider layer, the cache, and the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Granularity requested from the upstream ticker.
///
/// Ordered by upgrade priority: `Ltp < Ohlcv < Full`. `Subscribe` only ever
/// upgrades a token's mode, never downgrades it, within a drain window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ltp = 1,
    Ohlcv = 2,
    Full = 3,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "ltp" => Some(Mode::Ltp),
            "ohlcv" => Some(Mode::Ohlcv),
            "full" => Some(Mode::Full),
            _ => None,
        }
    }

    /// The higher-priority of two modes; used to implement upgrade-only semantics.
    pub fn upgrade(self, other: Mode) -> Mode {
        std::cmp::max(self, other)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Ltp => write!(f, "ltp"),
            Mode::Ohlcv => write!(f, "ohlcv"),
            Mode::Full => write!(f, "full"),
        }
    }
}

/// Exchange segments recognized for `EXCHANGE-TOKEN` pair resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    NseEq,
    NseFo,
    NseCur,
    McxFo,
}

impl Exchange {
    pub fn parse(s: &str) -> Option<Exchange> {
        match s.to_ascii_uppercase().as_str() {
            "NSE_EQ" => Some(Exchange::NseEq),
            "NSE_FO" => Some(Exchange::NseFo),
            "NSE_CUR" => Some(Exchange::NseCur),
            "MCX_FO" => Some(Exchange::McxFo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::NseEq => "NSE_EQ",
            Exchange::NseFo => "NSE_FO",
            Exchange::NseCur => "NSE_CUR",
            Exchange::McxFo => "MCX_FO",
        }
    }

    pub const fn default_exchange() -> Exchange {
        Exchange::NseEq
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An `EXCHANGE-TOKEN` pair, the canonical instrument identifier at the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentPair {
    pub exchange: Exchange,
    pub token: u32,
}

impl InstrumentPair {
    pub fn new(exchange: Exchange, token: u32) -> Self {
        Self { exchange, token }
    }

    /// Parses `"NSE_EQ-738561"`-shaped strings.
    pub fn parse(s: &str) -> Option<InstrumentPair> {
        let (exch, tok) = s.rsplit_once('-')?;
        let exchange = Exchange::parse(exch)?;
        let token: u32 = tok.parse().ok()?;
        Some(InstrumentPair::new(exchange, token))
    }
}

impl fmt::Display for InstrumentPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.exchange, self.token)
    }
}

/// OHLC candle fields, present on `ohlcv`/`full` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// A single update record for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub token: u32,
    pub last_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<u64>,
    /// Milliseconds since the epoch.
    pub ts: i64,
}

impl Tick {
    pub fn is_valid_price(&self) -> bool {
        self.last_price.is_finite() && self.last_price > 0.0
    }
}

/// Row held in the (external, read-through cached) api-key table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub tenant_id: String,
    pub is_active: bool,
    pub provider_override: Option<String>,
    pub rate_limit_per_minute: u32,
    pub connection_limit: u32,
    pub ws_subscribe_rps: Option<u32>,
    pub ws_unsubscribe_rps: Option<u32>,
    pub ws_mode_rps: Option<u32>,
    pub entitled_exchanges: Option<Vec<String>>,
}

/// Sticky abuse-detector verdict for one api-key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseFlag {
    pub api_key: String,
    pub risk_score: f64,
    pub reason_codes: Vec<String>,
    pub blocked: bool,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
}

/// `kind` discriminant of an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Http,
    Ws,
}

/// One append-only audit row, written in batches by the origin audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub route_or_event: String,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub api_key: Option<String>,
    pub tenant_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub duration_ms: Option<u64>,
    pub meta: Option<serde_json::Value>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Fields filled in for a quote/LTP/OHLC response, keyed by token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<u64>,
}

/// Which broker endpoint a request targets; also the `{endpoint}` key
/// component for the provider queue, request batcher, and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Quotes,
    Ltp,
    Ohlc,
    History,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Quotes => "quotes",
            Endpoint::Ltp => "ltp",
            Endpoint::Ohlc => "ohlc",
            Endpoint::History => "history",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_upgrade_is_order_independent() {
        assert_eq!(Mode::Ltp.upgrade(Mode::Full), Mode::Full);
        assert_eq!(Mode::Full.upgrade(Mode::Ltp), Mode::Full);
        assert_eq!(Mode::Ltp.upgrade(Mode::Ohlcv), Mode::Ohlcv);
        assert_eq!(Mode::Ohlcv.upgrade(Mode::Ltp), Mode::Ohlcv);
    }

    #[test]
    fn pair_parse_rejects_unknown_exchange() {
        assert!(InstrumentPair::parse("BSE_EQ-123").is_none());
        assert_eq!(
            InstrumentPair::parse("NSE_FO-738561"),
            Some(InstrumentPair::new(Exchange::NseFo, 738561))
        );
    }
}
