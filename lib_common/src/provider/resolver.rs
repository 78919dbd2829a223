//! # Provider Resolver
//!
//! Holds the *global active provider* name and hands back the matching
//! adapter singleton for both the HTTP and WS paths. Mirrors the
//! `RwLock`-guarded mode plus reconciliation-on-change shape used elsewhere
//! in this codebase for process-wide controllers.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connections::SharedStore;
use crate::model::ApiKeyRecord;
use crate::provider::MarketDataProvider;

const GLOBAL_PROVIDER_KEY: &str = "provider:global";

/// Notified whenever `set_global` actually changes the active provider, so
/// the stream multiplexer can reconcile the upstream ticker.
#[async_trait::async_trait]
pub trait ProviderChangeListener: Send + Sync {
    async fn on_provider_changed(&self, new_provider: &str);
}

pub struct ProviderResolver {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    /// In-process fallback used when the shared store is unavailable.
    local_fallback: RwLock<String>,
    store: Option<SharedStore>,
    listener: RwLock<Option<Arc<dyn ProviderChangeListener>>>,
}

impl ProviderResolver {
    pub fn new(providers: Vec<Arc<dyn MarketDataProvider>>, default_provider: String, store: Option<SharedStore>) -> Self {
        Self {
            providers,
            local_fallback: RwLock::new(default_provider),
            store,
            listener: RwLock::new(None),
        }
    }

    pub async fn set_listener(&self, listener: Arc<dyn ProviderChangeListener>) {
        *self.listener.write().await = Some(listener);
    }

    fn find(&self, name: &str) -> Option<Arc<dyn MarketDataProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// `ResolveForHTTP`: `x-provider` header → per-key override → global
    /// store value → in-process fallback.
    pub async fn resolve_for_http(
        &self,
        header_override: Option<&str>,
        key_record: Option<&ApiKeyRecord>,
    ) -> Arc<dyn MarketDataProvider> {
        if let Some(name) = header_override {
            if let Some(p) = self.find(name) {
                return p;
            }
        }
        if let Some(rec) = key_record {
            if let Some(name) = &rec.provider_override {
                if let Some(p) = self.find(name) {
                    return p;
                }
            }
        }
        self.resolve_for_ws().await
    }

    /// `ResolveForWS`: only the global value (or environment default).
    pub async fn resolve_for_ws(&self) -> Arc<dyn MarketDataProvider> {
        let name = self.get_global().await;
        self.find(&name)
            .unwrap_or_else(|| self.providers.first().cloned().expect("at least one provider configured"))
    }

    pub async fn get_global(&self) -> String {
        if let Some(store) = &self.store {
            if let Ok(Some(v)) = store.get(GLOBAL_PROVIDER_KEY).await {
                return v;
            }
        }
        self.local_fallback.read().await.clone()
    }

    /// `SetGlobal`: persists to the shared store with in-memory fallback;
    /// a no-op (no reconcile signal) when the value does not change.
    pub async fn set_global(&self, name: &str) {
        let previous = self.get_global().await;
        *self.local_fallback.write().await = name.to_string();
        if let Some(store) = &self.store {
            if let Err(e) = store.set(GLOBAL_PROVIDER_KEY, name).await {
                log::warn!("failed to persist global provider to shared store: {e}");
            }
        }
        if previous != name {
            if let Some(listener) = self.listener.read().await.as_ref() {
                listener.on_provider_changed(name).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Exchange, InstrumentPair, Ohlc, QuoteFields};
    use crate::provider::{Candle, InstrumentMeta, TickerEvent, TickerHandle};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct StubProvider(&'static str);

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn get_quote(&self, _tokens: &[u32]) -> crate::error::Result<HashMap<u32, QuoteFields>> {
            Ok(HashMap::new())
        }
        async fn get_ltp(&self, _tokens: &[u32]) -> crate::error::Result<HashMap<u32, f64>> {
            Ok(HashMap::new())
        }
        async fn get_ohlc(&self, _tokens: &[u32]) -> crate::error::Result<HashMap<u32, Ohlc>> {
            Ok(HashMap::new())
        }
        async fn get_historical_data(&self, _token: u32, _from_ts: i64, _to_ts: i64) -> crate::error::Result<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn get_instruments(&self) -> crate::error::Result<Vec<InstrumentMeta>> {
            Ok(Vec::new())
        }
        async fn get_ltp_by_pairs(&self, _pairs: &[InstrumentPair]) -> crate::error::Result<HashMap<InstrumentPair, f64>> {
            Ok(HashMap::new())
        }
        async fn initialize_ticker(&self, _events_tx: mpsc::UnboundedSender<TickerEvent>) -> crate::error::Result<TickerHandle> {
            let (tx, _rx) = mpsc::unbounded_channel();
            Ok(TickerHandle::new(tx))
        }
        async fn ping(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct CountingListener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderChangeListener for CountingListener {
        async fn on_provider_changed(&self, _new_provider: &str) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn set_global_to_same_value_does_not_notify() {
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![Arc::new(StubProvider("F")), Arc::new(StubProvider("V"))];
        let resolver = ProviderResolver::new(providers, "F".to_string(), None);
        let listener = Arc::new(CountingListener { calls: AtomicUsize::new(0) });
        resolver.set_listener(listener.clone()).await;

        resolver.set_global("F").await;
        assert_eq!(listener.calls.load(Ordering::Relaxed), 0);

        resolver.set_global("V").await;
        assert_eq!(listener.calls.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.resolve_for_ws().await.name(), "V");
    }
}
