//! Provider **F**: speaks a compact binary tick-packet protocol over its
//! WebSocket ticker, in the shape of a typical Indian-broker market feed —
//! an 8-byte header (`response_code`, `message_length`, `exchange_segment`,
//! `security_id`) followed by a payload that varies by response code.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Buf;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{GatewayError, Result};
use crate::http::ApiClient;
use crate::model::{Exchange, InstrumentPair, Mode, Ohlc, QuoteFields};
use crate::provider::{Candle, InstrumentMeta, MarketDataProvider, TickerCommand, TickerEvent, TickerHandle};

/// Response codes recognized in the first header byte of a binary packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedResponseCode {
    Ticker = 2,
    Quote = 4,
    PrevClose = 6,
    Full = 8,
}

impl FeedResponseCode {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            2 => Some(Self::Ticker),
            4 => Some(Self::Quote),
            6 => Some(Self::PrevClose),
            8 => Some(Self::Full),
            _ => None,
        }
    }
}

fn exchange_from_segment_byte(b: u8) -> Exchange {
    match b {
        1 => Exchange::NseFo,
        2 => Exchange::NseCur,
        5 => Exchange::McxFo,
        _ => Exchange::NseEq,
    }
}

fn segment_byte_from_exchange(e: Exchange) -> u8 {
    match e {
        Exchange::NseEq => 0,
        Exchange::NseFo => 1,
        Exchange::NseCur => 2,
        Exchange::McxFo => 5,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Decodes one binary packet into a [`crate::model::Tick`], if its response
/// code carries price data (ticker/quote/full; `PrevClose` is ignored, it
/// carries no `last_price`).
fn decode_packet(mut buf: &[u8]) -> Option<crate::model::Tick> {
    if buf.len() < 8 {
        return None;
    }
    let response_code = FeedResponseCode::from_u8(buf.get_u8())?;
    let _message_length = buf.get_u16();
    let _exchange_segment = buf.get_u8();
    let security_id = buf.get_u32();
    let ts = now_ms();

    match response_code {
        FeedResponseCode::Ticker => {
            if buf.len() < 8 {
                return None;
            }
            let ltp = buf.get_f32() as f64;
            Some(crate::model::Tick {
                token: security_id,
                last_price: ltp,
                ohlc: None,
                volume: None,
                oi: None,
                ts,
            })
        }
        FeedResponseCode::Quote | FeedResponseCode::Full => {
            if buf.len() < 44 {
                return None;
            }
            let ltp = buf.get_f32() as f64;
            let _last_qty = buf.get_i16();
            let _ltt = buf.get_i32();
            let _atp = buf.get_f32();
            let volume = buf.get_u32() as u64;
            let _total_sell_qty = buf.get_u32();
            let _total_buy_qty = buf.get_u32();
            let open = buf.get_f32() as f64;
            let close = buf.get_f32() as f64;
            let high = buf.get_f32() as f64;
            let low = buf.get_f32() as f64;
            Some(crate::model::Tick {
                token: security_id,
                last_price: ltp,
                ohlc: Some(Ohlc { open, high, low, close }),
                volume: Some(volume),
                oi: None,
                ts,
            })
        }
        FeedResponseCode::PrevClose => None,
    }
}

fn encode_subscribe(tokens: &[u32], exchange_of: impl Fn(u32) -> Exchange, subscribe: bool) -> String {
    #[derive(serde::Serialize)]
    #[allow(non_snake_case)]
    struct Instrument {
        ExchangeSegment: &'static str,
        SecurityId: String,
    }
    #[derive(serde::Serialize)]
    #[allow(non_snake_case)]
    struct FeedRequest {
        RequestCode: u8,
        InstrumentCount: usize,
        InstrumentList: Vec<Instrument>,
    }

    let list: Vec<Instrument> = tokens
        .iter()
        .map(|&t| Instrument {
            ExchangeSegment: match exchange_of(t) {
                Exchange::NseEq => "NSE_EQ",
                Exchange::NseFo => "NSE_FO",
                Exchange::NseCur => "NSE_CUR",
                Exchange::McxFo => "MCX_FO",
            },
            SecurityId: t.to_string(),
        })
        .collect();

    let request_code: u8 = if subscribe { 15 } else { 16 };
    serde_json::to_string(&FeedRequest {
        RequestCode: request_code,
        InstrumentCount: list.len(),
        InstrumentList: list,
    })
    .unwrap_or_default()
}

pub struct ProviderFConfig {
    pub http_base_url: String,
    pub ws_url: String,
    pub client_id: String,
    pub access_token: String,
}

pub struct ProviderF {
    http: ApiClient,
    ws_url: String,
}

impl ProviderF {
    pub fn new(config: ProviderFConfig) -> Self {
        let http = ApiClient::new(&config.http_base_url, Some(config.access_token.clone()));
        let ws_url = format!(
            "{}?client-id={}&access-token={}",
            config.ws_url, config.client_id, config.access_token
        );
        Self { http, ws_url }
    }
}

#[derive(serde::Deserialize)]
struct QuoteResponseEnvelope {
    data: HashMap<String, HashMap<String, QuoteRow>>,
}

#[derive(serde::Deserialize)]
struct QuoteRow {
    last_price: f64,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    ohlc: Option<Ohlc>,
}

#[async_trait]
impl MarketDataProvider for ProviderF {
    fn name(&self) -> &'static str {
        "F"
    }

    async fn get_quote(&self, tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>> {
        let body: HashMap<&str, Vec<u32>> = HashMap::from([("NSE_EQ", tokens.to_vec())]);
        let resp = self
            .http
            .post_json::<QuoteResponseEnvelope, _>("/v2/marketfeed/quote", &body)
            .await?;
        let mut out = HashMap::new();
        if let Some(envelope) = resp.data {
            for segment in envelope.data.values() {
                for (token_str, row) in segment {
                    if let Ok(token) = token_str.parse::<u32>() {
                        out.insert(
                            token,
                            QuoteFields {
                                last_price: Some(row.last_price),
                                ohlc: row.ohlc,
                                volume: row.volume,
                                oi: None,
                            },
                        );
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_ltp(&self, tokens: &[u32]) -> Result<HashMap<u32, f64>> {
        let body: HashMap<&str, Vec<u32>> = HashMap::from([("NSE_EQ", tokens.to_vec())]);
        let resp = self
            .http
            .post_json::<QuoteResponseEnvelope, _>("/v2/marketfeed/ltp", &body)
            .await?;
        let mut out = HashMap::new();
        if let Some(envelope) = resp.data {
            for segment in envelope.data.values() {
                for (token_str, row) in segment {
                    if let Ok(token) = token_str.parse::<u32>() {
                        out.insert(token, row.last_price);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_ohlc(&self, tokens: &[u32]) -> Result<HashMap<u32, Ohlc>> {
        let quotes = self.get_quote(tokens).await?;
        Ok(quotes
            .into_iter()
            .filter_map(|(token, fields)| fields.ohlc.map(|ohlc| (token, ohlc)))
            .collect())
    }

    async fn get_historical_data(&self, token: u32, from_ts: i64, to_ts: i64) -> Result<Vec<Candle>> {
        #[derive(serde::Serialize)]
        struct HistReq {
            security_id: String,
            from: i64,
            to: i64,
        }
        #[derive(serde::Deserialize)]
        struct HistResp {
            open: Vec<f64>,
            high: Vec<f64>,
            low: Vec<f64>,
            close: Vec<f64>,
            volume: Vec<u64>,
            timestamp: Vec<i64>,
        }
        let resp = self
            .http
            .post_json::<HistResp, _>(
                "/v2/charts/historical",
                &HistReq {
                    security_id: token.to_string(),
                    from: from_ts,
                    to: to_ts,
                },
            )
            .await?;
        let Some(body) = resp.data else {
            return Ok(Vec::new());
        };
        let n = body.timestamp.len();
        Ok((0..n)
            .map(|i| Candle {
                ts: body.timestamp[i],
                ohlc: Ohlc {
                    open: body.open[i],
                    high: body.high[i],
                    low: body.low[i],
                    close: body.close[i],
                },
                volume: body.volume.get(i).copied().unwrap_or(0),
            })
            .collect())
    }

    async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
        #[derive(serde::Deserialize)]
        struct Row {
            security_id: u32,
            exchange_segment: String,
            trading_symbol: String,
        }
        let resp = self.http.get::<Vec<Row>>("/v2/instruments").await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                Exchange::parse(&row.exchange_segment).map(|exchange| InstrumentMeta {
                    token: row.security_id,
                    exchange,
                    symbol: row.trading_symbol,
                })
            })
            .collect())
    }

    async fn get_ltp_by_pairs(&self, pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>> {
        let mut by_exchange: HashMap<&'static str, Vec<u32>> = HashMap::new();
        for pair in pairs {
            by_exchange.entry(pair.exchange.as_str()).or_default().push(pair.token);
        }
        let resp = self
            .http
            .post_json::<QuoteResponseEnvelope, _>("/v2/marketfeed/ltp", &by_exchange)
            .await?;
        let mut out = HashMap::new();
        if let Some(envelope) = resp.data {
            for (segment, rows) in envelope.data {
                let Some(exchange) = Exchange::parse(&segment) else {
                    continue;
                };
                for (token_str, row) in rows {
                    if let Ok(token) = token_str.parse::<u32>() {
                        out.insert(InstrumentPair::new(exchange, token), row.last_price);
                    }
                }
            }
        }
        for pair in pairs {
            out.entry(*pair).or_insert(0.0);
        }
        Ok(out)
    }

    async fn initialize_ticker(&self, events_tx: mpsc::UnboundedSender<TickerEvent>) -> Result<TickerHandle> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ws_url = self.ws_url.clone();
        tokio::spawn(run_ticker_loop(ws_url, cmd_rx, events_tx));
        Ok(TickerHandle::new(cmd_tx))
    }

    async fn ping(&self) -> Result<()> {
        self.http.get::<serde_json::Value>("/v2/fundlimit").await?;
        Ok(())
    }
}

/// Reconnect loop: 1000 + rand(0, 2000) ms initial delay, exponential
/// backoff on repeated failures, full resubscribe of the live set on
/// reconnect (tracked locally since the upstream has no "current set" query).
async fn run_ticker_loop(
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<TickerCommand>,
    events_tx: mpsc::UnboundedSender<TickerEvent>,
) {
    let mut live: HashMap<u32, (Exchange, Mode)> = HashMap::new();
    let mut attempt: u32 = 0;

    'reconnect: loop {
        if attempt > 0 {
            let base = 1000u64 + rand::rng().random_range(0..2000);
            let backoff = base.saturating_mul(1 << attempt.min(6));
            sleep(Duration::from_millis(backoff.min(60_000))).await;
        }
        attempt += 1;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = events_tx.send(TickerEvent::Error(e.to_string()));
                continue 'reconnect;
            }
        };
        attempt = 0;
        let _ = events_tx.send(TickerEvent::Connected);
        let (mut write, mut read) = ws_stream.split();

        if !live.is_empty() {
            let tokens: Vec<u32> = live.keys().copied().collect();
            let msg = encode_subscribe(&tokens, |t| live.get(&t).map(|(e, _)| *e).unwrap_or(Exchange::NseEq), true);
            if write.send(Message::Text(msg.into())).await.is_err() {
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TickerCommand::Subscribe(tokens, mode)) => {
                            for t in &tokens {
                                live.entry(*t).and_modify(|(_, m)| *m = (*m).max(mode)).or_insert((Exchange::NseEq, mode));
                            }
                            let msg = encode_subscribe(&tokens, |t| live.get(&t).map(|(e, _)| *e).unwrap_or(Exchange::NseEq), true);
                            if write.send(Message::Text(msg.into())).await.is_err() {
                                continue 'reconnect;
                            }
                        }
                        Some(TickerCommand::Unsubscribe(tokens)) => {
                            for t in &tokens {
                                live.remove(t);
                            }
                            let msg = encode_subscribe(&tokens, |_| Exchange::NseEq, false);
                            if write.send(Message::Text(msg.into())).await.is_err() {
                                continue 'reconnect;
                            }
                        }
                        Some(TickerCommand::Disconnect) | None => {
                            let _ = write.close().await;
                            let _ = events_tx.send(TickerEvent::Disconnected);
                            return;
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Some(tick) = decode_packet(&bytes) {
                                let _ = events_tx.send(TickerEvent::Tick(tick));
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = events_tx.send(TickerEvent::Disconnected);
                            continue 'reconnect;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            let _ = events_tx.send(TickerEvent::Error(e.to_string()));
                            let _ = events_tx.send(TickerEvent::Disconnected);
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

#[allow(dead_code)]
fn ensure_segment_roundtrip(e: Exchange) -> Exchange {
    exchange_from_segment_byte(segment_byte_from_exchange(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ticker_packet() {
        let mut buf = Vec::new();
        buf.push(2u8); // response code
        buf.extend_from_slice(&16u16.to_be_bytes());
        buf.push(0u8); // exchange segment
        buf.extend_from_slice(&738561u32.to_be_bytes());
        buf.extend_from_slice(&123.45f32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());

        let tick = decode_packet(&buf).expect("ticker packet decodes");
        assert_eq!(tick.token, 738561);
        assert!((tick.last_price - 123.45).abs() < 0.01);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(decode_packet(&[0u8; 4]).is_none());
    }

    #[test]
    fn segment_byte_roundtrips() {
        for e in [Exchange::NseEq, Exchange::NseFo, Exchange::NseCur, Exchange::McxFo] {
            assert_eq!(ensure_segment_roundtrip(e), e);
        }
    }
}
