//! # Application State
//!
//! Everything a request handler needs, built once in `main` and shared via
//! axum's `State` extractor.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use lib_common::cache::LtpCache;
use lib_common::connections::{Database, SharedStore};
use lib_common::error::Result;
use lib_common::provider::provider_f::{ProviderF, ProviderFConfig};
use lib_common::provider::provider_v::{ProviderV, ProviderVConfig};
use lib_common::provider::queue::ProviderQueue;
use lib_common::provider::resolver::ProviderResolver;
use lib_common::provider::MarketDataProvider;
use lib_common::batch::RequestBatcher;
use lib_common::usage::UsageTracker;

use crate::abuse::AbuseDetector;
use crate::audit::AuditSink;
use crate::broadcast::ClientRegistry;
use crate::config::Config;
use crate::multiplexer::Multiplexer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: Arc<ProviderResolver>,
    pub queue: Arc<ProviderQueue>,
    pub cache: Arc<LtpCache>,
    pub batcher: Arc<RequestBatcher>,
    pub usage: Arc<UsageTracker>,
    pub db: Arc<Database>,
    pub store: Option<SharedStore>,
    pub registry: Arc<ClientRegistry>,
    pub multiplexer: Arc<Multiplexer>,
    pub abuse: Arc<AbuseDetector>,
    pub audit: Arc<AuditSink>,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub async fn new(config: Config, metrics_handle: PrometheusHandle) -> Result<Self> {
        let db = Database::new(&config.database_url, config.database_max_connections).await?;
        let store = match SharedStore::connect(&config.redis_url).await {
            Ok(store) => Some(store),
            Err(e) => {
                log::warn!(
                    "shared store unreachable at startup ({e}); continuing with in-process fallbacks only"
                );
                None
            }
        };

        let provider_f: Arc<dyn MarketDataProvider> = Arc::new(ProviderF::new(ProviderFConfig {
            http_base_url: config.provider_f_http_base_url.clone(),
            ws_url: config.provider_f_ws_url.clone(),
            client_id: config.provider_f_client_id.clone(),
            access_token: config.provider_f_access_token.clone(),
        }));
        let provider_v: Arc<dyn MarketDataProvider> = Arc::new(ProviderV::new(ProviderVConfig {
            http_base_url: config.provider_v_http_base_url.clone(),
            ws_url: config.provider_v_ws_url.clone(),
            api_key: config.provider_v_api_key.clone(),
        }));

        let resolver = Arc::new(ProviderResolver::new(
            vec![provider_f, provider_v],
            config.data_provider.clone(),
            store.clone(),
        ));

        let queue = Arc::new(ProviderQueue::new(store.clone()));
        let cache = Arc::new(LtpCache::new());
        let batcher = Arc::new(RequestBatcher::new(queue.clone(), cache.clone()));

        let usage = Arc::new(UsageTracker::new(db.clone(), store.clone()));

        let db = Arc::new(db);
        let registry = Arc::new(ClientRegistry::new());
        let multiplexer = Multiplexer::new_arc(registry.clone(), cache.clone(), store.clone(), resolver.clone());
        resolver.set_listener(multiplexer.clone()).await;

        let abuse = Arc::new(AbuseDetector::new(db.clone(), &config));
        let audit = Arc::new(AuditSink::new(db.clone(), &config));

        Ok(Self {
            config: Arc::new(config),
            resolver,
            queue,
            cache,
            batcher,
            usage,
            db,
            store,
            registry,
            multiplexer,
            abuse,
            audit,
            metrics_handle,
        })
    }
}
