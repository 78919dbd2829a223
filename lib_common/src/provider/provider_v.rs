//! Provider **V**: speaks a plain JSON tick protocol over its WebSocket
//! ticker — one `{"token":...,"mode":...}` subscribe frame and one
//! `{"token":...,"last_price":...,"ts":...}` tick frame per update, the
//! shape a JSON-first broker feed takes as opposed to provider F's packed
//! binary wire format.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;
use crate::http::ApiClient;
use crate::model::{Exchange, InstrumentPair, Mode, Ohlc, QuoteFields, Tick};
use crate::provider::{Candle, InstrumentMeta, MarketDataProvider, TickerCommand, TickerEvent, TickerHandle};

pub struct ProviderVConfig {
    pub http_base_url: String,
    pub ws_url: String,
    pub api_key: String,
}

pub struct ProviderV {
    http: ApiClient,
    ws_url: String,
}

impl ProviderV {
    pub fn new(config: ProviderVConfig) -> Self {
        let http = ApiClient::new(&config.http_base_url, Some(config.api_key.clone()));
        let ws_url = format!("{}?api_key={}", config.ws_url, config.api_key);
        Self { http, ws_url }
    }
}

#[derive(Serialize)]
struct SubscribeFrame {
    action: &'static str,
    tokens: Vec<u32>,
    mode: Option<&'static str>,
}

#[derive(Deserialize)]
struct TickFrame {
    token: u32,
    last_price: f64,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    oi: Option<u64>,
    ts: i64,
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Ltp => "ltp",
        Mode::Ohlcv => "ohlcv",
        Mode::Full => "full",
    }
}

#[derive(Deserialize)]
struct QuoteRow {
    last_price: f64,
    #[serde(default)]
    ohlc: Option<Ohlc>,
    #[serde(default)]
    volume: Option<u64>,
}

#[async_trait]
impl MarketDataProvider for ProviderV {
    fn name(&self) -> &'static str {
        "V"
    }

    async fn get_quote(&self, tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>> {
        #[derive(Serialize)]
        struct Req<'a> {
            tokens: &'a [u32],
        }
        let resp = self
            .http
            .post_json::<HashMap<u32, QuoteRow>, _>("/api/v1/quote", &Req { tokens })
            .await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(token, row)| {
                (
                    token,
                    QuoteFields {
                        last_price: Some(row.last_price),
                        ohlc: row.ohlc,
                        volume: row.volume,
                        oi: None,
                    },
                )
            })
            .collect())
    }

    async fn get_ltp(&self, tokens: &[u32]) -> Result<HashMap<u32, f64>> {
        #[derive(Serialize)]
        struct Req<'a> {
            tokens: &'a [u32],
        }
        let resp = self
            .http
            .post_json::<HashMap<u32, f64>, _>("/api/v1/ltp", &Req { tokens })
            .await?;
        Ok(resp.data.unwrap_or_default())
    }

    async fn get_ohlc(&self, tokens: &[u32]) -> Result<HashMap<u32, Ohlc>> {
        let quotes = self.get_quote(tokens).await?;
        Ok(quotes
            .into_iter()
            .filter_map(|(token, fields)| fields.ohlc.map(|ohlc| (token, ohlc)))
            .collect())
    }

    async fn get_historical_data(&self, token: u32, from_ts: i64, to_ts: i64) -> Result<Vec<Candle>> {
        #[derive(Serialize)]
        struct Req {
            token: u32,
            from: i64,
            to: i64,
        }
        #[derive(Deserialize)]
        struct Row {
            ts: i64,
            open: f64,
            high: f64,
            low: f64,
            close: f64,
            volume: u64,
        }
        let resp = self
            .http
            .post_json::<Vec<Row>, _>("/api/v1/history", &Req { token, from: from_ts, to: to_ts })
            .await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|row| Candle {
                ts: row.ts,
                ohlc: Ohlc {
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                },
                volume: row.volume,
            })
            .collect())
    }

    async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
        #[derive(Deserialize)]
        struct Row {
            token: u32,
            exchange: String,
            symbol: String,
        }
        let resp = self.http.get::<Vec<Row>>("/api/v1/instruments").await?;
        Ok(resp
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                Exchange::parse(&row.exchange).map(|exchange| InstrumentMeta {
                    token: row.token,
                    exchange,
                    symbol: row.symbol,
                })
            })
            .collect())
    }

    async fn get_ltp_by_pairs(&self, pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>> {
        let tokens: Vec<u32> = pairs.iter().map(|p| p.token).collect();
        let by_token = self.get_ltp(&tokens).await?;
        Ok(pairs
            .iter()
            .map(|pair| (*pair, by_token.get(&pair.token).copied().unwrap_or(0.0)))
            .collect())
    }

    async fn initialize_ticker(&self, events_tx: mpsc::UnboundedSender<TickerEvent>) -> Result<TickerHandle> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ws_url = self.ws_url.clone();
        tokio::spawn(run_ticker_loop(ws_url, cmd_rx, events_tx));
        Ok(TickerHandle::new(cmd_tx))
    }

    async fn ping(&self) -> Result<()> {
        self.http.get::<serde_json::Value>("/api/v1/status").await?;
        Ok(())
    }
}

async fn run_ticker_loop(
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<TickerCommand>,
    events_tx: mpsc::UnboundedSender<TickerEvent>,
) {
    let mut live: HashMap<u32, Mode> = HashMap::new();
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
            let highest = live.values().copied().max().unwrap_or(Mode::Ltp);
            let frame = SubscribeFrame {
                action: "subscribe",
                tokens,
                mode: Some(mode_str(highest)),
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                if write.send(Message::Text(json.into())).await.is_err() {
                    continue 'reconnect;
                }
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(TickerCommand::Subscribe(tokens, mode)) => {
                            for t in &tokens {
                                live.entry(*t).and_modify(|m| *m = (*m).max(mode)).or_insert(mode);
                            }
                            let frame = SubscribeFrame { action: "subscribe", tokens, mode: Some(mode_str(mode)) };
                            if let Ok(json) = serde_json::to_string(&frame) {
                                if write.send(Message::Text(json.into())).await.is_err() {
                                    continue 'reconnect;
                                }
                            }
                        }
                        Some(TickerCommand::Unsubscribe(tokens)) => {
                            for t in &tokens {
                                live.remove(t);
                            }
                            let frame = SubscribeFrame { action: "unsubscribe", tokens, mode: None };
                            if let Ok(json) = serde_json::to_string(&frame) {
                                if write.send(Message::Text(json.into())).await.is_err() {
                                    continue 'reconnect;
                                }
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
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(tf) = serde_json::from_str::<TickFrame>(&text) {
                                let ohlc = match (tf.open, tf.high, tf.low, tf.close) {
                                    (Some(open), Some(high), Some(low), Some(close)) => {
                                        Some(Ohlc { open, high, low, close })
                                    }
                                    _ => None,
                                };
                                let _ = events_tx.send(TickerEvent::Tick(Tick {
                                    token: tf.token,
                                    last_price: tf.last_price,
                                    ohlc,
                                    volume: tf.volume,
                                    oi: tf.oi,
                                    ts: tf.ts,
                                }));
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_frame_decodes_ltp_only() {
        let json = r#"{"token":738561,"last_price":101.5,"ts":1700000000000}"#;
        let tf: TickFrame = serde_json::from_str(json).unwrap();
        assert_eq!(tf.token, 738561);
        assert_eq!(tf.open, None);
    }
}
