//! # Provider Adapter
//!
//! A uniform interface over a broker's HTTP surface (`Quote`, `LTP`, `OHLC`,
//! `History`, `Instruments`) and its WebSocket ticker
//! (`Connect`/`Subscribe`/`Unsubscribe`/`SetMode`, events `Tick`/`Connected`/
//! `Disconnected`/`Error`), with two interchangeable implementations
//! ([`provider_f`] and [`provider_v`]) selected at runtime by [`resolver`].
//!
//! At most one ticker task runs per provider instance per process; the
//! [`crate::provider::resolver::ProviderResolver`] and the stream
//! multiplexer above it are what guarantee that.

pub mod provider_f;
pub mod provider_v;
pub mod queue;
pub mod resolver;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{Exchange, InstrumentPair, Mode, Ohlc, QuoteFields};

/// One OHLCV candle returned by `GetHistoricalData`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub ohlc: Ohlc,
    pub volume: u64,
}

/// An instrument row as advertised by the broker's instrument list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstrumentMeta {
    pub token: u32,
    pub exchange: Exchange,
    pub symbol: String,
}

/// Event pushed from a running ticker task to its owner (the stream
/// multiplexer), per the adapter's `Tick`/`Connected`/`Disconnected`/`Error`
/// vocabulary.
#[derive(Debug, Clone)]
pub enum TickerEvent {
    Connected,
    Disconnected,
    Error(String),
    Tick(crate::model::Tick),
}

/// Commands accepted by a running ticker task; enqueued by [`TickerHandle`]
/// and drained inside the task's event loop.
#[derive(Debug, Clone)]
pub enum TickerCommand {
    Subscribe(Vec<u32>, Mode),
    Unsubscribe(Vec<u32>),
    Disconnect,
}

/// A live handle to a provider's running ticker task. Cheap to clone;
/// `subscribe`/`unsubscribe` just enqueue a command for the task to apply on
/// its next message-loop iteration, matching the fire-and-forget shape the
/// stream multiplexer's 500 ms drain loop expects.
#[derive(Clone)]
pub struct TickerHandle {
    cmd_tx: mpsc::UnboundedSender<TickerCommand>,
}

impl TickerHandle {
    pub fn new(cmd_tx: mpsc::UnboundedSender<TickerCommand>) -> Self {
        Self { cmd_tx }
    }

    pub fn subscribe(&self, tokens: Vec<u32>, mode: Mode) -> Result<()> {
        self.send(TickerCommand::Subscribe(tokens, mode))
    }

    pub fn unsubscribe(&self, tokens: Vec<u32>) -> Result<()> {
        self.send(TickerCommand::Unsubscribe(tokens))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(TickerCommand::Disconnect)
    }

    fn send(&self, cmd: TickerCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| crate::error::GatewayError::StreamInactive)
    }
}

/// Uniform interface implemented once per broker. `F` and `V` are the two
/// concrete providers the resolver switches between; callers never match on
/// the concrete type.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Stable identifier used in config, admin endpoints, and metrics labels.
    fn name(&self) -> &'static str;

    async fn get_quote(&self, tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>>;

    async fn get_ltp(&self, tokens: &[u32]) -> Result<HashMap<u32, f64>>;

    async fn get_ohlc(&self, tokens: &[u32]) -> Result<HashMap<u32, Ohlc>>;

    async fn get_historical_data(&self, token: u32, from_ts: i64, to_ts: i64) -> Result<Vec<Candle>>;

    async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>>;

    async fn get_ltp_by_pairs(&self, pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>>;

    /// Spawns the background reconnect-loop task and returns a handle to it.
    /// `events_tx` receives every `Tick`/`Connected`/`Disconnected`/`Error`
    /// the ticker produces for as long as the task lives.
    async fn initialize_ticker(&self, events_tx: mpsc::UnboundedSender<TickerEvent>) -> Result<TickerHandle>;

    /// Tears down and re-establishes the ticker, used after a credential
    /// refresh or an explicit admin restart. Default implementation just
    /// disconnects the old handle and initializes a fresh one; callers are
    /// responsible for replaying the current upstream subscription set.
    async fn restart_ticker(
        &self,
        old: &TickerHandle,
        events_tx: mpsc::UnboundedSender<TickerEvent>,
    ) -> Result<TickerHandle> {
        let _ = old.disconnect();
        self.initialize_ticker(events_tx).await
    }

    /// Lightweight liveness probe used by `/health/detailed`.
    async fn ping(&self) -> Result<()>;
}
