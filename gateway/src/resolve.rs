//! Instrument/entitlement/blocklist/rate-limit helpers shared by the WS
//! gateway and the client REST surface, so neither duplicates the other's
//! resolution logic.

use lib_common::error::GatewayError;
use lib_common::model::{ApiKeyRecord, Exchange, InstrumentPair, Mode};

use crate::state::AppState;

pub fn resolve_mode(mode: Option<&str>) -> Result<Mode, GatewayError> {
    match mode {
        None => Ok(Mode::Ltp),
        Some(s) => Mode::parse(s).ok_or_else(|| GatewayError::InvalidMode(s.to_string())),
    }
}

/// Parses each instrument string as either a bare numeric token or an
/// `EXCHANGE-TOKEN` pair; bare tokens are resolved to their exchange via the
/// relational store for entitlement/blocklist checks.
pub async fn resolve_instruments(
    state: &AppState,
    instruments: &[String],
) -> Result<Vec<(u32, Exchange)>, GatewayError> {
    let mut out = Vec::with_capacity(instruments.len());
    for raw in instruments {
        if let Some((exch, tok)) = raw.rsplit_once('-') {
            let exchange = Exchange::parse(exch).ok_or_else(|| GatewayError::InvalidExchange(exch.to_string()))?;
            let token: u32 = tok.parse().map_err(|_| GatewayError::InvalidPayload(format!("invalid instrument {raw}")))?;
            out.push((token, exchange));
            continue;
        }
        let token: u32 = raw.parse().map_err(|_| GatewayError::InvalidPayload(format!("invalid instrument {raw}")))?;
        let exchange = match state.db.resolve_exchange(token).await {
            Ok(Some(s)) => Exchange::parse(&s).unwrap_or(Exchange::default_exchange()),
            Ok(None) => Exchange::default_exchange(),
            Err(e) => {
                log::warn!("exchange resolution failed for token {token}: {e}");
                Exchange::default_exchange()
            }
        };
        out.push((token, exchange));
    }
    Ok(out)
}

/// `EXCHANGE-TOKEN` pairs where the exchange segment must parse against the
/// four recognized segments; used by the pair-LTP REST path, which rejects
/// (rather than defaults) an unknown exchange per spec.md's boundary case.
pub fn parse_pairs_strict(raw: &[String]) -> Result<Vec<InstrumentPair>, GatewayError> {
    raw.iter()
        .map(|s| InstrumentPair::parse(s).ok_or_else(|| GatewayError::InvalidExchange(s.clone())))
        .collect()
}

pub fn check_entitlement(record: &ApiKeyRecord, exchange: Exchange) -> Result<(), GatewayError> {
    if let Some(entitled) = &record.entitled_exchanges {
        if !entitled.iter().any(|e| e == exchange.as_str()) {
            return Err(GatewayError::EntitlementDenied(exchange.as_str().to_string()));
        }
    }
    Ok(())
}

pub async fn check_blocklist(
    state: &AppState,
    api_key: &str,
    tenant_id: &str,
    token: u32,
    exchange: Exchange,
) -> Result<(), GatewayError> {
    let Some(store) = &state.store else { return Ok(()) };
    let checks: [(&str, String); 4] = [
        ("ws:block:tokens", token.to_string()),
        ("ws:block:exchanges", exchange.as_str().to_string()),
        ("ws:block:apikeys", api_key.to_string()),
        ("ws:block:tenants", tenant_id.to_string()),
    ];
    for (set_key, member) in checks {
        if store.sismember(set_key, &member).await.unwrap_or(false) {
            return Err(GatewayError::EntitlementDenied(format!("blocked: {set_key}")));
        }
    }
    Ok(())
}

pub async fn enforce_rps(
    state: &AppState,
    api_key: &str,
    event: &str,
    default_limit: u32,
    override_limit: Option<u32>,
) -> Result<(), GatewayError> {
    let limit = override_limit.unwrap_or(default_limit);
    match state.usage.check_ws_rate_limit(api_key, event, limit).await {
        Ok(None) => Ok(()),
        Ok(Some(retry_after_ms)) => Err(GatewayError::RateLimited { retry_after_ms }),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_with_unrecognized_exchange_is_rejected() {
        let raw = vec!["BSE_EQ-123".to_string()];
        let err = parse_pairs_strict(&raw).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidExchange(e) if e == "BSE_EQ-123"));
    }

    #[test]
    fn recognized_pairs_parse_in_order() {
        let raw = vec!["NSE_EQ-738561".to_string(), "MCX_FO-429001".to_string()];
        let pairs = parse_pairs_strict(&raw).unwrap();
        assert_eq!(
            pairs,
            vec![
                InstrumentPair::new(Exchange::NseEq, 738561),
                InstrumentPair::new(Exchange::McxFo, 429001),
            ]
        );
    }
}
