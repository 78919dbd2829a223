//! # API-Key & Usage
//!
//! Validates api-keys against the relational store (with a short
//! in-process cache, since that table changes rarely), and tracks the
//! minute/second usage buckets in the shared store. Usage counters fail
//! open: a shared-store outage degrades to "unmetered", never to an outage
//! of the gateway itself. Key *validation* does not fail open — an
//! unreachable relational store means the caller can't be trusted yet,
//! so that error propagates instead of being swallowed.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::connections::{Database, SharedStore};
use crate::error::{GatewayError, Result};
use crate::model::ApiKeyRecord;

const KEY_CACHE_TTL: Duration = Duration::from_secs(30);
const HTTP_BUCKET_TTL_SECS: u64 = 65;
const WS_CONNECTION_TTL_SECS: u64 = 3600;
const WS_RATE_BUCKET_TTL_SECS: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub http_requests_this_minute: i64,
    pub current_ws_connections: i64,
}

/// In-process counters used when the shared store is unavailable (either
/// unreachable at startup or erroring on a call); mirrors
/// [`crate::provider::queue::ProviderQueue`]'s local-fallback idiom so usage
/// tracking degrades to "unmetered per process" rather than blocking
/// gateway startup or request handling.
#[derive(Default)]
struct LocalCounters {
    http_buckets: StdMutex<HashMap<String, i64>>,
    ws_connections: StdMutex<HashMap<String, i64>>,
    ws_rate_buckets: StdMutex<HashMap<String, i64>>,
}

pub struct UsageTracker {
    db: Database,
    store: Option<SharedStore>,
    key_cache: StdMutex<HashMap<String, (ApiKeyRecord, Instant)>>,
    local: LocalCounters,
}

impl UsageTracker {
    pub fn new(db: Database, store: Option<SharedStore>) -> Self {
        Self {
            db,
            store,
            key_cache: StdMutex::new(HashMap::new()),
            local: LocalCounters::default(),
        }
    }

    /// Reads an api-key record, serving a cached copy for up to 30 s.
    pub async fn validate_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        if let Some(cached) = self.cached(key) {
            return Ok(Some(cached));
        }
        let record = self.db.get_api_key(key).await?;
        if let Some(rec) = &record {
            self.key_cache
                .lock()
                .unwrap()
                .insert(key.to_string(), (rec.clone(), Instant::now()));
        }
        Ok(record)
    }

    fn cached(&self, key: &str) -> Option<ApiKeyRecord> {
        let cache = self.key_cache.lock().unwrap();
        let (rec, at) = cache.get(key)?;
        if at.elapsed() <= KEY_CACHE_TTL {
            Some(rec.clone())
        } else {
            None
        }
    }

    fn local_incr(map: &StdMutex<HashMap<String, i64>>, key: &str) -> i64 {
        let mut map = map.lock().unwrap();
        let count = map.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Bumps the minute bucket; raises `RateLimitExceeded` once the caller
    /// crosses `limit_per_minute` for the current minute. Falls back to an
    /// in-process bucket (reset on process restart, not cluster-wide) when
    /// the shared store is absent or erroring.
    pub async fn increment_http_usage(&self, key: &str, limit_per_minute: u32) -> Result<()> {
        let bucket = Utc::now().format("%Y%m%d%H%M");
        let redis_key = format!("http:ratelimit:{key}:{bucket}");
        let count = match &self.store {
            Some(store) => match store.incr_with_ttl(&redis_key, HTTP_BUCKET_TTL_SECS).await {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("http usage counter unavailable for {key}: {e}");
                    return Ok(());
                }
            },
            None => Self::local_incr(&self.local.http_buckets, &redis_key),
        };
        if count > limit_per_minute as i64 {
            Err(GatewayError::RateLimitExceeded)
        } else {
            Ok(())
        }
    }

    /// Atomic increment with expiry; decrements again before raising so a
    /// refused admission never leaks a counter slot.
    pub async fn track_ws_connection(&self, key: &str, connection_limit: u32) -> Result<()> {
        let redis_key = format!("ws:connections:{key}");
        let count = match &self.store {
            Some(store) => match store.incr_with_ttl(&redis_key, WS_CONNECTION_TTL_SECS).await {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("ws connection counter unavailable for {key}: {e}");
                    return Ok(());
                }
            },
            None => Self::local_incr(&self.local.ws_connections, &redis_key),
        };
        if count > connection_limit as i64 {
            match &self.store {
                Some(store) => {
                    if let Err(e) = store.decr(&redis_key).await {
                        log::warn!("failed to roll back ws connection counter for {key}: {e}");
                    }
                }
                None => {
                    let mut map = self.local.ws_connections.lock().unwrap();
                    if let Some(c) = map.get_mut(&redis_key) {
                        *c -= 1;
                    }
                }
            }
            return Err(GatewayError::ConnectionLimitExceeded);
        }
        Ok(())
    }

    pub async fn untrack_ws_connection(&self, key: &str) {
        let redis_key = format!("ws:connections:{key}");
        match &self.store {
            Some(store) => {
                if let Err(e) = store.decr(&redis_key).await {
                    log::warn!("failed to decrement ws connection counter for {key}: {e}");
                }
            }
            None => {
                let mut map = self.local.ws_connections.lock().unwrap();
                if let Some(c) = map.get_mut(&redis_key) {
                    *c -= 1;
                }
            }
        }
    }

    /// 1 s bucket counter; `Ok(None)` means allowed, `Ok(Some(retry_after_ms))`
    /// means throttled. Fails open (allowed) if the store is unreachable.
    pub async fn check_ws_rate_limit(&self, scope_id: &str, event: &str, rps_limit: u32) -> Result<Option<u64>> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let epoch_sec = now.as_secs();
        let redis_key = format!("ws:rate:{scope_id}:{event}:{epoch_sec}");
        let count = match &self.store {
            Some(store) => match store.incr_with_ttl(&redis_key, WS_RATE_BUCKET_TTL_SECS).await {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("ws rate limit bucket unavailable for {scope_id}/{event}: {e}");
                    return Ok(None);
                }
            },
            None => Self::local_incr(&self.local.ws_rate_buckets, &redis_key),
        };
        if count > rps_limit as i64 {
            let retry_after_ms = 1000 - now.subsec_millis() as u64;
            Ok(Some(retry_after_ms.max(1)))
        } else {
            Ok(None)
        }
    }

    /// Reads both counters for the admin/diagnostic surface; defaults to
    /// zero on a store miss or error rather than failing the request.
    pub async fn get_usage_report(&self, key: &str) -> UsageReport {
        let bucket = Utc::now().format("%Y%m%d%H%M");
        let http_key = format!("http:ratelimit:{key}:{bucket}");
        let ws_key = format!("ws:connections:{key}");

        let (http_requests_this_minute, current_ws_connections) = match &self.store {
            Some(store) => {
                let http = store.get(&http_key).await.ok().flatten().and_then(|v| v.parse().ok()).unwrap_or(0);
                let ws = store.get(&ws_key).await.ok().flatten().and_then(|v| v.parse().ok()).unwrap_or(0);
                (http, ws)
            }
            None => {
                let http = *self.local.http_buckets.lock().unwrap().get(&http_key).unwrap_or(&0);
                let ws = *self.local.ws_connections.lock().unwrap().get(&ws_key).unwrap_or(&0);
                (http, ws)
            }
        };

        UsageReport {
            http_requests_this_minute,
            current_ws_connections,
        }
    }
}
