//! # Request Batcher
//!
//! Coalesces concurrent REST callers asking for the same broker endpoint in
//! the same second into one (chunked, rate-gated) provider call, then
//! backfills any still-missing `last_price` from the LTP cache and, failing
//! that, one extra gated `GetLTP` call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::sleep_until;

use crate::cache::LtpCache;
use crate::error::Result;
use crate::model::{Endpoint, InstrumentPair, QuoteFields};
use crate::provider::queue::ProviderQueue;
use crate::provider::MarketDataProvider;

const CHUNK_SIZE: usize = 1000;
const WINDOW: Duration = Duration::from_secs(1);
const STALE_WITHIN: Duration = Duration::from_secs(5);

struct PendingWindow {
    tokens: HashSet<u32>,
    waiters: Vec<(HashSet<u32>, oneshot::Sender<HashMap<u32, QuoteFields>>)>,
}

struct PendingPairWindow {
    pairs: HashSet<InstrumentPair>,
    waiters: Vec<(HashSet<InstrumentPair>, oneshot::Sender<HashMap<InstrumentPair, Option<f64>>>)>,
}

/// Metrics counters exposed to the metrics registry; exported as plain
/// atomics here and read by `gateway::metrics` rather than depending on the
/// `metrics` crate's recorder directly inside this coalescing hot path.
#[derive(Default)]
pub struct BatcherCounters {
    pub total_requests: AtomicU64,
    pub batched_calls: AtomicU64,
    pub dedup_savings: AtomicU64,
}

struct Inner {
    windows: AsyncMutex<HashMap<Endpoint, PendingWindow>>,
    pair_window: AsyncMutex<Option<PendingPairWindow>>,
    counters: BatcherCounters,
}

pub struct RequestBatcher {
    queue: Arc<ProviderQueue>,
    cache: Arc<LtpCache>,
    inner: Arc<Inner>,
}

impl RequestBatcher {
    pub fn new(queue: Arc<ProviderQueue>, cache: Arc<LtpCache>) -> Self {
        Self {
            queue,
            cache,
            inner: Arc::new(Inner {
                windows: AsyncMutex::new(HashMap::new()),
                pair_window: AsyncMutex::new(None),
                counters: BatcherCounters::default(),
            }),
        }
    }

    pub fn counters(&self) -> &BatcherCounters {
        &self.inner.counters
    }

    /// Quote/LTP/OHLC share one coalescing path; `endpoint` also selects
    /// which provider method the closed window's chunks are executed with.
    pub async fn request(
        &self,
        endpoint: Endpoint,
        tokens: Vec<u32>,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<HashMap<u32, QuoteFields>> {
        self.inner.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let wanted: HashSet<u32> = tokens.into_iter().collect();
        let rx = {
            let mut windows = self.inner.windows.lock().await;
            match windows.get_mut(&endpoint) {
                Some(window) => {
                    window.tokens.extend(wanted.iter().copied());
                    let (tx, rx) = oneshot::channel();
                    window.waiters.push((wanted.clone(), tx));
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    windows.insert(
                        endpoint,
                        PendingWindow {
                            tokens: wanted.clone(),
                            waiters: vec![(wanted.clone(), tx)],
                        },
                    );
                    let deadline = Instant::now() + WINDOW;
                    self.spawn_closer(endpoint, deadline, provider);
                    rx
                }
            }
        };

        let merged = rx.await.map_err(|_| crate::error::GatewayError::ProviderError {
            message: "batch window closed without a result".into(),
            retryable: true,
        })?;
        Ok(merged.into_iter().filter(|(t, _)| wanted.contains(t)).collect())
    }

    fn spawn_closer(&self, endpoint: Endpoint, deadline: Instant, provider: Arc<dyn MarketDataProvider>) {
        let queue = self.queue.clone();
        let cache = self.cache.clone();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let windows = &inner.windows;
            let counters = &inner.counters;
            sleep_until(deadline.into()).await;
            let window = {
                let mut guard = windows.lock().await;
                guard.remove(&endpoint)
            };
            let Some(window) = window else { return };

            let all_tokens: Vec<u32> = window.tokens.into_iter().collect();
            let mut merged: HashMap<u32, QuoteFields> = HashMap::new();

            for chunk in all_tokens.chunks(CHUNK_SIZE) {
                let chunk_vec = chunk.to_vec();
                let provider = provider.clone();
                counters.batched_calls.fetch_add(1, Ordering::Relaxed);
                let result = queue
                    .execute(endpoint, || async move { fetch_chunk(endpoint, &provider, &chunk_vec).await })
                    .await;
                match result {
                    Ok(fields) => merged.extend(fields),
                    Err(e) => log::warn!("batched {endpoint} call failed: {e}"),
                }
            }

            let mut missing: Vec<u32> = Vec::new();
            for &token in &all_tokens {
                let needs_fill = merged
                    .get(&token)
                    .and_then(|f| f.last_price)
                    .map(|p| !p.is_finite() || p <= 0.0)
                    .unwrap_or(true);
                if needs_fill {
                    if let Some(price) = cache.get_stale_within(token, STALE_WITHIN) {
                        merged.entry(token).or_default().last_price = Some(price);
                    } else {
                        missing.push(token);
                    }
                }
            }

            if !missing.is_empty() {
                let provider = provider.clone();
                let missing_clone = missing.clone();
                let fallback = queue
                    .execute(Endpoint::Ltp, || async move { provider.get_ltp(&missing_clone).await })
                    .await;
                if let Ok(ltp_map) = fallback {
                    for (token, price) in ltp_map {
                        merged.entry(token).or_default().last_price = Some(price);
                    }
                }
            }

            let saved = window.waiters.len().saturating_sub(1) as u64;
            counters.dedup_savings.fetch_add(saved, Ordering::Relaxed);

            for (wanted, tx) in window.waiters {
                let slice: HashMap<u32, QuoteFields> = merged
                    .iter()
                    .filter(|(t, _)| wanted.contains(t))
                    .map(|(t, f)| (*t, f.clone()))
                    .collect();
                let _ = tx.send(slice);
            }
        });
    }

    /// Pair-LTP variant: coalescing is over `EXCHANGE-TOKEN` pairs instead
    /// of bare tokens. Always returns an entry for every requested pair,
    /// `None` when unknown, so callers never need to handle absent keys.
    pub async fn request_ltp_by_pairs(
        &self,
        pairs: Vec<InstrumentPair>,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<HashMap<InstrumentPair, Option<f64>>> {
        self.inner.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let wanted: HashSet<InstrumentPair> = pairs.into_iter().collect();
        let rx = {
            let mut slot = self.inner.pair_window.lock().await;
            match slot.as_mut() {
                Some(window) => {
                    window.pairs.extend(wanted.iter().copied());
                    let (tx, rx) = oneshot::channel();
                    window.waiters.push((wanted.clone(), tx));
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    *slot = Some(PendingPairWindow {
                        pairs: wanted.clone(),
                        waiters: vec![(wanted.clone(), tx)],
                    });
                    let deadline = Instant::now() + WINDOW;
                    self.spawn_pair_closer(deadline, provider);
                    rx
                }
            }
        };

        let merged = rx.await.map_err(|_| crate::error::GatewayError::ProviderError {
            message: "pair batch window closed without a result".into(),
            retryable: true,
        })?;
        Ok(wanted.into_iter().map(|p| (p, merged.get(&p).copied().flatten())).collect())
    }

    fn spawn_pair_closer(&self, deadline: Instant, provider: Arc<dyn MarketDataProvider>) {
        let queue = self.queue.clone();
        let cache = self.cache.clone();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            sleep_until(deadline.into()).await;
            let window = {
                let mut guard = inner.pair_window.lock().await;
                guard.take()
            };
            let Some(window) = window else { return };

            let all_pairs: Vec<InstrumentPair> = window.pairs.into_iter().collect();
            let mut merged: HashMap<InstrumentPair, Option<f64>> = HashMap::new();

            for chunk in all_pairs.chunks(CHUNK_SIZE) {
                let chunk_vec = chunk.to_vec();
                let provider = provider.clone();
                let result = queue
                    .execute(Endpoint::Ltp, || async move { provider.get_ltp_by_pairs(&chunk_vec).await })
                    .await;
                match result {
                    Ok(prices) => {
                        for (pair, price) in prices {
                            merged.insert(pair, Some(price).filter(|p| p.is_finite() && *p > 0.0));
                        }
                    }
                    Err(e) => log::warn!("batched ltp-by-pairs call failed: {e}"),
                }
            }

            for pair in &all_pairs {
                if merged.get(pair).and_then(|v| *v).is_none() {
                    if let Some(price) = cache.get_stale_within(pair.token, STALE_WITHIN) {
                        merged.insert(*pair, Some(price));
                    }
                }
            }

            for (wanted, tx) in window.waiters {
                let slice: HashMap<InstrumentPair, Option<f64>> = wanted
                    .into_iter()
                    .map(|p| (p, merged.get(&p).copied().flatten()))
                    .collect();
                let _ = tx.send(slice);
            }
        });
    }
}

async fn fetch_chunk(
    endpoint: Endpoint,
    provider: &Arc<dyn MarketDataProvider>,
    chunk: &[u32],
) -> Result<HashMap<u32, QuoteFields>> {
    match endpoint {
        Endpoint::Quotes => provider.get_quote(chunk).await,
        Endpoint::Ltp => Ok(provider
            .get_ltp(chunk)
            .await?
            .into_iter()
            .map(|(t, p)| (t, QuoteFields { last_price: Some(p), ..Default::default() }))
            .collect()),
        Endpoint::Ohlc => Ok(provider
            .get_ohlc(chunk)
            .await?
            .into_iter()
            .map(|(t, ohlc)| {
                (
                    t,
                    QuoteFields {
                        last_price: None,
                        ohlc: Some(ohlc),
                        volume: None,
                        oi: None,
                    },
                )
            })
            .collect()),
        Endpoint::History => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ohlc;
    use crate::provider::{Candle, InstrumentMeta};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn get_quote(&self, _tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>> {
            Ok(HashMap::new())
        }

        async fn get_ltp(&self, tokens: &[u32]) -> Result<HashMap<u32, f64>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(tokens.iter().map(|&t| (t, t as f64)).collect())
        }

        async fn get_ohlc(&self, _tokens: &[u32]) -> Result<HashMap<u32, Ohlc>> {
            Ok(HashMap::new())
        }

        async fn get_historical_data(&self, _token: u32, _from_ts: i64, _to_ts: i64) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
            Ok(Vec::new())
        }

        async fn get_ltp_by_pairs(&self, _pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>> {
            Ok(HashMap::new())
        }

        async fn initialize_ticker(
            &self,
            _events_tx: tokio::sync::mpsc::UnboundedSender<crate::provider::TickerEvent>,
        ) -> Result<crate::provider::TickerHandle> {
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(crate::provider::TickerHandle::new(tx))
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Two overlapping-token callers in the same window coalesce into one
    /// upstream call per 1000-token chunk, each receiving only what it asked
    /// for, and the dedup counter reflects the one caller whose tokens were
    /// already covered.
    #[tokio::test(start_paused = true)]
    async fn overlapping_callers_coalesce_into_one_batched_call() {
        let provider: Arc<dyn MarketDataProvider> = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let batcher = RequestBatcher::new(Arc::new(ProviderQueue::new(None)), Arc::new(LtpCache::new()));

        let p1 = provider.clone();
        let b1 = &batcher;
        let first = async { b1.request(Endpoint::Ltp, vec![256265, 260105], p1).await.unwrap() };
        let p2 = provider.clone();
        let second = async { b1.request(Endpoint::Ltp, vec![256265, 738561], p2).await.unwrap() };

        let (r1, r2) = tokio::join!(first, second);
        assert_eq!(r1.keys().copied().collect::<HashSet<_>>(), HashSet::from([256265, 260105]));
        assert_eq!(r2.keys().copied().collect::<HashSet<_>>(), HashSet::from([256265, 738561]));
        assert_eq!(batcher.counters().dedup_savings.load(Ordering::Relaxed), 1);
    }

    /// A union spanning two 1000-token chunks issues exactly
    /// `ceil(|union|/1000)` upstream calls, per the batcher's chunking
    /// invariant.
    #[tokio::test(start_paused = true)]
    async fn large_union_issues_one_call_per_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        struct ChunkCountingProvider {
            calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl MarketDataProvider for ChunkCountingProvider {
            fn name(&self) -> &'static str {
                "mock"
            }
            async fn get_quote(&self, _tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>> {
                Ok(HashMap::new())
            }
            async fn get_ltp(&self, tokens: &[u32]) -> Result<HashMap<u32, f64>> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                Ok(tokens.iter().map(|&t| (t, t as f64)).collect())
            }
            async fn get_ohlc(&self, _tokens: &[u32]) -> Result<HashMap<u32, Ohlc>> {
                Ok(HashMap::new())
            }
            async fn get_historical_data(&self, _token: u32, _from_ts: i64, _to_ts: i64) -> Result<Vec<Candle>> {
                Ok(Vec::new())
            }
            async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
                Ok(Vec::new())
            }
            async fn get_ltp_by_pairs(&self, _pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>> {
                Ok(HashMap::new())
            }
            async fn initialize_ticker(
                &self,
                _events_tx: tokio::sync::mpsc::UnboundedSender<crate::provider::TickerEvent>,
            ) -> Result<crate::provider::TickerHandle> {
                let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
                Ok(crate::provider::TickerHandle::new(tx))
            }
            async fn ping(&self) -> Result<()> {
                Ok(())
            }
        }

        let provider: Arc<dyn MarketDataProvider> = Arc::new(ChunkCountingProvider { calls: calls.clone() });
        let batcher = RequestBatcher::new(Arc::new(ProviderQueue::new(None)), Arc::new(LtpCache::new()));
        let tokens: Vec<u32> = (0..1500).collect();

        batcher.request(Endpoint::Ltp, tokens, provider).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    /// The pair-LTP variant always returns one entry per requested pair,
    /// `None` for anything the provider didn't price, so callers never have
    /// to special-case an absent key.
    #[tokio::test(start_paused = true)]
    async fn pair_ltp_returns_an_entry_for_every_requested_pair() {
        struct PairProvider;
        #[async_trait]
        impl MarketDataProvider for PairProvider {
            fn name(&self) -> &'static str {
                "mock"
            }
            async fn get_quote(&self, _tokens: &[u32]) -> Result<HashMap<u32, QuoteFields>> {
                Ok(HashMap::new())
            }
            async fn get_ltp(&self, _tokens: &[u32]) -> Result<HashMap<u32, f64>> {
                Ok(HashMap::new())
            }
            async fn get_ohlc(&self, _tokens: &[u32]) -> Result<HashMap<u32, Ohlc>> {
                Ok(HashMap::new())
            }
            async fn get_historical_data(&self, _token: u32, _from_ts: i64, _to_ts: i64) -> Result<Vec<Candle>> {
                Ok(Vec::new())
            }
            async fn get_instruments(&self) -> Result<Vec<InstrumentMeta>> {
                Ok(Vec::new())
            }
            async fn get_ltp_by_pairs(&self, pairs: &[InstrumentPair]) -> Result<HashMap<InstrumentPair, f64>> {
                // Only prices the first pair; the second is left unpriced to
                // exercise the "missing result" branch.
                Ok(pairs.iter().take(1).map(|&p| (p, 101.5)).collect())
            }
            async fn initialize_ticker(
                &self,
                _events_tx: tokio::sync::mpsc::UnboundedSender<crate::provider::TickerEvent>,
            ) -> Result<crate::provider::TickerHandle> {
                let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
                Ok(crate::provider::TickerHandle::new(tx))
            }
            async fn ping(&self) -> Result<()> {
                Ok(())
            }
        }

        let provider: Arc<dyn MarketDataProvider> = Arc::new(PairProvider);
        let batcher = RequestBatcher::new(Arc::new(ProviderQueue::new(None)), Arc::new(LtpCache::new()));
        let priced = crate::model::Exchange::NseEq;
        let unpriced = crate::model::Exchange::NseFo;
        let pairs = vec![InstrumentPair::new(priced, 738561), InstrumentPair::new(unpriced, 429001)];

        let result = batcher.request_ltp_by_pairs(pairs.clone(), provider).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[&pairs[0]], Some(101.5));
        assert_eq!(result[&pairs[1]], None);
    }
}
