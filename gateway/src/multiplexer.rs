//! # Stream Multiplexer
//!
//! The sole mutator of the upstream ticker's subscription set. Owns the
//! per-token reference count that lets many sockets share one upstream
//! subscription, a 500 ms drain loop that coalesces subscribe/unsubscribe
//! churn into chunked ticker calls, and the tick handler that fans each
//! incoming price update out to exactly the sockets still interested in it.
//!
//! Reachability to individual sockets comes from [`crate::broadcast::ClientRegistry`]
//! rather than a reference back to the WS gateway — that's what keeps this
//! module's dependency on the gateway one-way despite the two needing each
//! other at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lib_common::cache::LtpCache;
use lib_common::connections::SharedStore;
use lib_common::error::Result;
use lib_common::model::{Mode, Tick};
use lib_common::provider::resolver::ProviderChangeListener;
use lib_common::provider::resolver::ProviderResolver;
use lib_common::provider::{TickerEvent, TickerHandle};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::broadcast::{ClientId, ClientRegistry, OutboundEvent};
use crate::metrics;

const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
const SUBSCRIBE_CHUNK: usize = 500;
const UNSUBSCRIBE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Starting,
    Connected,
    Disconnected,
    Closing,
}

struct UpstreamSub {
    mode: Mode,
    clients: HashSet<ClientId>,
}

struct Shared {
    table: AsyncMutex<HashMap<u32, UpstreamSub>>,
    pending_subscribe: AsyncMutex<HashMap<u32, Mode>>,
    pending_unsubscribe: AsyncMutex<HashSet<u32>>,
    subscribed_instruments: AsyncMutex<HashSet<u32>>,
    ticker: AsyncMutex<Option<TickerHandle>>,
    state: AsyncMutex<StreamState>,
    drain_started: AtomicU64,
}

pub struct Multiplexer {
    shared: Arc<Shared>,
    registry: Arc<ClientRegistry>,
    cache: Arc<LtpCache>,
    store: Option<SharedStore>,
    resolver: Arc<ProviderResolver>,
    /// Set once by [`Multiplexer::new_arc`] so the `ProviderChangeListener`
    /// impl (which only gets `&self`) can still spawn `reconnect_if_streaming`,
    /// which needs an `Arc<Self>`.
    self_ref: AsyncMutex<Weak<Multiplexer>>,
}

impl Multiplexer {
    /// Constructs the multiplexer wrapped in the `Arc` its own provider-change
    /// listener impl needs to reconnect itself; use this instead of a bare
    /// `new` + separate `Arc::new` so the self-reference is always populated.
    pub fn new_arc(
        registry: Arc<ClientRegistry>,
        cache: Arc<LtpCache>,
        store: Option<SharedStore>,
        resolver: Arc<ProviderResolver>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            shared: Arc::new(Shared {
                table: AsyncMutex::new(HashMap::new()),
                pending_subscribe: AsyncMutex::new(HashMap::new()),
                pending_unsubscribe: AsyncMutex::new(HashSet::new()),
                subscribed_instruments: AsyncMutex::new(HashSet::new()),
                ticker: AsyncMutex::new(None),
                state: AsyncMutex::new(StreamState::Idle),
                drain_started: AtomicU64::new(0),
            }),
            registry,
            cache,
            store,
            resolver,
            self_ref: AsyncMutex::new(Weak::new()),
        });
        let weak = Arc::downgrade(&this);
        if let Ok(mut slot) = this.self_ref.try_lock() {
            *slot = weak;
        }
        this
    }

    pub async fn subscribed_instrument_count(&self) -> usize {
        self.shared.subscribed_instruments.lock().await.len()
    }

    pub async fn stream_status(&self) -> &'static str {
        match *self.shared.state.lock().await {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Connected => "connected",
            StreamState::Disconnected => "disconnected",
            StreamState::Closing => "closing",
        }
    }

    /// Adds `client_id` as an interested party for each token, creating the
    /// upstream-subscription row on first interest and upgrading its mode
    /// (never downgrading) on repeat interest.
    pub async fn subscribe(&self, tokens: &[u32], mode: Mode, client_id: ClientId) {
        let mut table = self.shared.table.lock().await;
        let mut pending = self.shared.pending_subscribe.lock().await;
        for &token in tokens {
            let row = table.entry(token).or_insert_with(|| UpstreamSub {
                mode,
                clients: HashSet::new(),
            });
            row.mode = row.mode.upgrade(mode);
            row.clients.insert(client_id);
            pending
                .entry(token)
                .and_modify(|m| *m = (*m).upgrade(row.mode))
                .or_insert(row.mode);
        }
    }

    /// Drops `client_id`'s interest; once a token's subscriber count reaches
    /// zero it's queued for upstream unsubscribe and its row is dropped.
    pub async fn unsubscribe(&self, tokens: &[u32], client_id: ClientId) {
        let mut table = self.shared.table.lock().await;
        let mut pending_sub = self.shared.pending_subscribe.lock().await;
        let mut pending_unsub = self.shared.pending_unsubscribe.lock().await;
        for &token in tokens {
            if let Some(row) = table.get_mut(&token) {
                row.clients.remove(&client_id);
                if row.clients.is_empty() {
                    table.remove(&token);
                    pending_sub.remove(&token);
                    pending_unsub.insert(token);
                }
            }
        }
    }

    /// Removes every trace of `client_id` across all tokens; used on socket
    /// disconnect instead of requiring the caller to enumerate its set.
    pub async fn unsubscribe_all(&self, client_id: ClientId, tokens: &[u32]) {
        self.unsubscribe(tokens, client_id).await;
    }

    /// Idempotent: a second call while already starting/connected is a no-op.
    pub async fn start_streaming(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.shared.state.lock().await;
            if matches!(*state, StreamState::Starting | StreamState::Connected) {
                return Ok(());
            }
        }
        *self.shared.state.lock().await = StreamState::Starting;

        let provider = self.resolver.resolve_for_ws().await;
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TickerEvent>();
        let handle = provider.initialize_ticker(events_tx).await?;
        *self.shared.ticker.lock().await = Some(handle);

        let this = self.clone();
        tokio::spawn(async move { this.run_event_loop(events_rx).await });

        if self.shared.drain_started.fetch_add(1, Ordering::SeqCst) == 0 {
            let this = self.clone();
            tokio::spawn(async move { this.run_drain_loop().await });
        }

        // Replay the current subscription table in full (e.g. after a
        // provider switch); the drain loop will pick these up on its next
        // tick instead of requiring an immediate flush here.
        let table = self.shared.table.lock().await;
        let mut pending = self.shared.pending_subscribe.lock().await;
        for (&token, row) in table.iter() {
            pending.entry(token).and_modify(|m| *m = (*m).upgrade(row.mode)).or_insert(row.mode);
        }
        Ok(())
    }

    pub async fn stop_streaming(&self) {
        *self.shared.state.lock().await = StreamState::Closing;
        if let Some(handle) = self.shared.ticker.lock().await.take() {
            let _ = handle.disconnect();
        }
        *self.shared.state.lock().await = StreamState::Idle;
    }

    pub async fn reconnect_if_streaming(self: &Arc<Self>) -> Result<()> {
        let connected = matches!(
            *self.shared.state.lock().await,
            StreamState::Connected | StreamState::Starting | StreamState::Disconnected
        );
        if connected {
            self.stop_streaming().await;
            self.start_streaming().await?;
        }
        Ok(())
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<TickerEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                TickerEvent::Connected => {
                    *self.shared.state.lock().await = StreamState::Connected;
                    log::info!("upstream ticker connected");
                }
                TickerEvent::Disconnected => {
                    *self.shared.state.lock().await = StreamState::Disconnected;
                    log::warn!("upstream ticker disconnected; adapter will retry with backoff");
                }
                TickerEvent::Error(message) => {
                    log::warn!("upstream ticker error: {message}");
                }
                TickerEvent::Tick(tick) => {
                    self.handle_tick(tick).await;
                }
            }
        }
    }

    async fn handle_tick(&self, tick: Tick) {
        if !tick.is_valid_price() {
            return;
        }
        self.shared.subscribed_instruments.lock().await.insert(tick.token);
        self.cache.record_tick(self.store.as_ref(), &tick).await;

        let clients = {
            let table = self.shared.table.lock().await;
            table.get(&tick.token).map(|row| row.clients.clone())
        };
        let Some(clients) = clients else { return };
        let Ok(data) = serde_json::to_value(&tick) else { return };
        for client_id in clients {
            let sent = self.registry.try_send(
                client_id,
                OutboundEvent::MarketData {
                    token: tick.token,
                    data: data.clone(),
                    ts: tick.ts,
                },
            );
            if !sent {
                metrics::record_ws_backpressure_drop();
            }
        }
    }

    async fn run_drain_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(DRAIN_INTERVAL);
        loop {
            interval.tick().await;
            let connected = matches!(*self.shared.state.lock().await, StreamState::Connected);
            if !connected {
                continue;
            }
            let Some(handle) = self.shared.ticker.lock().await.clone() else { continue };

            let subscribes: Vec<(u32, Mode)> = {
                let mut pending = self.shared.pending_subscribe.lock().await;
                let items = pending.drain().collect();
                items
            };
            let mut by_mode: HashMap<Mode, Vec<u32>> = HashMap::new();
            for (token, mode) in subscribes {
                by_mode.entry(mode).or_default().push(token);
            }
            for (mode, tokens) in by_mode {
                for chunk in tokens.chunks(SUBSCRIBE_CHUNK) {
                    if let Err(e) = handle.subscribe(chunk.to_vec(), mode) {
                        log::warn!("drain loop subscribe failed: {e}");
                    }
                }
            }

            let unsubscribes: Vec<u32> = {
                let mut pending = self.shared.pending_unsubscribe.lock().await;
                pending.drain().collect()
            };
            for chunk in unsubscribes.chunks(UNSUBSCRIBE_CHUNK) {
                if let Err(e) = handle.unsubscribe(chunk.to_vec()) {
                    log::warn!("drain loop unsubscribe failed: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl ProviderChangeListener for Multiplexer {
    async fn on_provider_changed(&self, new_provider: &str) {
        log::info!("active provider changed to {new_provider}; reconnecting stream if live");
        let this = self.self_ref.lock().await.upgrade();
        let Some(this) = this else {
            log::warn!("provider-change listener fired before multiplexer self-reference was set");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.reconnect_if_streaming().await {
                log::warn!("failed to reconcile stream after provider change: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::model::{Ohlc, QuoteFields};
    use lib_common::provider::resolver::ProviderResolver;
    use lib_common::provider::{Candle, InstrumentMeta, MarketDataProvider};
    use lib_common::model::InstrumentPair;

    struct StubProvider;

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }
        async fn get_quote(&self, _tokens: &[u32]) -> Result<std::collections::HashMap<u32, QuoteFields>> {
            Ok(std::collections::HashMap::new())
        }
        async fn get_ltp(&self, _tokens: &[u32]) -> Result<std::collections::HashMap<u32, f64>> {
            Ok(std::collections::HashMap::new())
        }
        async fn get_ohlc(&self, _tokens: &[u32]) -> Result<std::collections::HashMap<u32, Ohlc>> {
            Ok(std::collections::HashMap::new())
        }
        async fn get_historical_data(&self, _token: u32, _from_ts: i64, _to_ts: i64) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
            Ok(Vec::new())
        }
        async fn get_ltp_by_pairs(&self, _pairs: &[InstrumentPair]) -> Result<std::collections::HashMap<InstrumentPair, f64>> {
            Ok(std::collections::HashMap::new())
        }
        async fn initialize_ticker(&self, _events_tx: mpsc::UnboundedSender<TickerEvent>) -> Result<TickerHandle> {
            let (tx, _rx) = mpsc::unbounded_channel();
            Ok(TickerHandle::new(tx))
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn new_test_multiplexer() -> Arc<Multiplexer> {
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![Arc::new(StubProvider)];
        let resolver = Arc::new(ProviderResolver::new(providers, "stub".to_string(), None));
        Multiplexer::new_arc(Arc::new(ClientRegistry::new()), Arc::new(LtpCache::new()), None, resolver)
    }

    #[tokio::test]
    async fn subscribe_upgrades_mode_regardless_of_order() {
        let mux = new_test_multiplexer();
        let client = 1;

        mux.subscribe(&[111], Mode::Ltp, client).await;
        mux.subscribe(&[111], Mode::Full, client).await;
        assert_eq!(mux.shared.table.lock().await.get(&111).unwrap().mode, Mode::Full);

        let mux2 = new_test_multiplexer();
        mux2.subscribe(&[222], Mode::Full, client).await;
        mux2.subscribe(&[222], Mode::Ltp, client).await;
        assert_eq!(mux2.shared.table.lock().await.get(&222).unwrap().mode, Mode::Full);
    }

    #[tokio::test]
    async fn unsubscribe_after_subscribe_leaves_no_trace() {
        let mux = new_test_multiplexer();
        let client = 7;

        mux.subscribe(&[333], Mode::Ltp, client).await;
        assert!(mux.shared.table.lock().await.contains_key(&333));

        mux.unsubscribe(&[333], client).await;
        assert!(!mux.shared.table.lock().await.contains_key(&333));
        assert!(mux.shared.pending_unsubscribe.lock().await.contains(&333));
        assert!(!mux.shared.pending_subscribe.lock().await.contains_key(&333));
    }

    #[tokio::test]
    async fn unsubscribe_keeps_row_while_other_clients_remain_interested() {
        let mux = new_test_multiplexer();
        mux.subscribe(&[444], Mode::Ltp, 1).await;
        mux.subscribe(&[444], Mode::Ltp, 2).await;

        mux.unsubscribe(&[444], 1).await;
        assert!(mux.shared.table.lock().await.contains_key(&444));

        mux.unsubscribe(&[444], 2).await;
        assert!(!mux.shared.table.lock().await.contains_key(&444));
    }
}
