//! # Provider Queue
//!
//! A distributed, cluster-wide 1-request-per-second gate per broker
//! endpoint, with an in-process fallback so the service keeps making
//! progress if the shared store is unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;

use crate::connections::SharedStore;
use crate::error::Result;
use crate::model::Endpoint;

const SPIN_CEILING: Duration = Duration::from_secs(5);
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Per-endpoint in-process throttle state used when the shared store is
/// unreachable; guarantees the cluster keeps serving, at the cost of the
/// cluster-wide 1/sec guarantee degrading to a per-process 1/sec guarantee.
struct LocalThrottle {
    last_run: AsyncMutex<Instant>,
}

impl LocalThrottle {
    fn new() -> Self {
        Self {
            last_run: AsyncMutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    async fn wait_turn(&self) {
        let mut last = self.last_run.lock().await;
        let elapsed = last.elapsed();
        if elapsed < Duration::from_secs(1) {
            sleep(Duration::from_secs(1) - elapsed).await;
        }
        *last = Instant::now();
    }
}

pub struct ProviderQueue {
    store: Option<SharedStore>,
    local_throttles: AsyncMutex<HashMap<&'static str, Arc<LocalThrottle>>>,
    last_warn_at: AsyncMutex<HashMap<&'static str, Instant>>,
    lock_owner_seq: AtomicI64,
}

impl ProviderQueue {
    pub fn new(store: Option<SharedStore>) -> Self {
        Self {
            store,
            local_throttles: AsyncMutex::new(HashMap::new()),
            last_warn_at: AsyncMutex::new(HashMap::new()),
            lock_owner_seq: AtomicI64::new(0),
        }
    }

    async fn local_throttle_for(&self, endpoint: Endpoint) -> Arc<LocalThrottle> {
        let mut map = self.local_throttles.lock().await;
        map.entry(endpoint.as_str())
            .or_insert_with(|| Arc::new(LocalThrottle::new()))
            .clone()
    }

    async fn warn_rate_limited(&self, endpoint: Endpoint, msg: &str) {
        let mut last = self.last_warn_at.lock().await;
        let now = Instant::now();
        let should_warn = last
            .get(endpoint.as_str())
            .map(|t| now.duration_since(*t) >= WARN_INTERVAL)
            .unwrap_or(true);
        if should_warn {
            log::warn!("provider queue fallback for {endpoint}: {msg}");
            last.insert(endpoint.as_str(), now);
        }
    }

    /// Runs `f` once this process (or the cluster, while the shared store is
    /// healthy) has acquired the per-endpoint 1 req/sec gate.
    pub async fn execute<T, F, Fut>(&self, endpoint: Endpoint, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let Some(store) = &self.store else {
            self.warn_rate_limited(endpoint, "shared store not configured").await;
            self.local_throttle_for(endpoint).await.wait_turn().await;
            return f().await;
        };

        let lock_key = format!("providerLock:{endpoint}");
        let owner = self.lock_owner_seq.fetch_add(1, Ordering::Relaxed);
        let owner_token = format!("{owner}:{}", std::process::id());
        let ttl_ms: u64 = 1000 + rand::rng().random_range(50..150);
        let spin_start = Instant::now();

        loop {
            match store.set_nx_px(&lock_key, &owner_token, ttl_ms).await {
                Ok(true) => return f().await,
                Ok(false) => {
                    if spin_start.elapsed() >= SPIN_CEILING {
                        self.warn_rate_limited(endpoint, "spin ceiling exceeded").await;
                        self.local_throttle_for(endpoint).await.wait_turn().await;
                        return f().await;
                    }
                    let remaining_ms = store.pttl(&lock_key).await.unwrap_or(100).max(0) as u64;
                    let jitter_ms: u64 = rand::rng().random_range(25..100);
                    sleep(Duration::from_millis(remaining_ms + jitter_ms)).await;
                }
                Err(e) => {
                    self.warn_rate_limited(endpoint, &format!("store error: {e}")).await;
                    self.local_throttle_for(endpoint).await.wait_turn().await;
                    return f().await;
                }
            }
        }
    }
}
