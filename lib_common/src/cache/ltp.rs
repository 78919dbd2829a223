//! # LTP Cache
//!
//! Two-tier hot-read cache for last-traded-price lookups: a process-local
//! fixed-capacity LRU with a 5 s TTL, backed by a pub/sub-capable shared
//! store keyed by token for cross-instance reads. The manual LRU here is a
//! fixed-capacity map plus an ordered eviction index — no cycles, no
//! external crate needed for something this small.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::connections::SharedStore;
use crate::model::{Ohlc, Tick};

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Entry {
    price: f64,
    updated_at: Instant,
}

/// Shape written to (and read from) the shared store's `last_tick:{token}`
/// key. TTL is applied by the caller when persisting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastTickRecord {
    pub last_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlc: Option<Ohlc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<u64>,
    pub ts: i64,
}

impl From<&Tick> for LastTickRecord {
    fn from(t: &Tick) -> Self {
        Self {
            last_price: t.last_price,
            ohlc: t.ohlc,
            volume: t.volume,
            oi: t.oi,
            ts: t.ts,
        }
    }
}

pub struct LtpCache {
    entries: std::sync::Mutex<HashMap<u32, Entry>>,
    lru_order: std::sync::Mutex<VecDeque<u32>>,
    capacity: usize,
    ttl: Duration,
}

impl LtpCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
            lru_order: std::sync::Mutex::new(VecDeque::new()),
            capacity,
            ttl: DEFAULT_TTL,
        }
    }

    /// Ignores non-finite or non-positive prices, bumps LRU, evicts the
    /// oldest entry if over capacity.
    pub fn set(&self, token: u32, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        let mut order = self.lru_order.lock().unwrap();

        if entries.insert(token, Entry { price, updated_at: Instant::now() }).is_none() {
            order.push_back(token);
            if entries.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    entries.remove(&oldest);
                }
            }
        } else {
            order.retain(|&t| t != token);
            order.push_back(token);
        }
    }

    /// Honors the 5 s TTL.
    pub fn get(&self, token: u32) -> Option<f64> {
        self.get_stale_within(token, self.ttl)
    }

    /// Does not delete or reorder; used by the batcher's enrichment path
    /// which tolerates slightly stale reads.
    pub fn get_stale_within(&self, token: u32, window: Duration) -> Option<f64> {
        let entries = self.entries.lock().unwrap();
        entries.get(&token).and_then(|e| {
            if e.updated_at.elapsed() <= window {
                Some(e.price)
            } else {
                None
            }
        })
    }

    pub fn get_many(&self, tokens: &[u32]) -> HashMap<u32, Option<f64>> {
        tokens.iter().map(|&t| (t, self.get(t))).collect()
    }

    pub fn get_many_stale_within(&self, tokens: &[u32], window: Duration) -> HashMap<u32, Option<f64>> {
        tokens.iter().map(|&t| (t, self.get_stale_within(t, window))).collect()
    }

    /// Writes the local tier and (best-effort) the shared store's
    /// `last_tick:{token}` key with a short TTL, per the tick handler's
    /// "cache write happens-before broadcast" invariant.
    pub async fn record_tick(&self, store: Option<&SharedStore>, tick: &Tick) {
        self.set(tick.token, tick.last_price);
        if let Some(store) = store {
            let record = LastTickRecord::from(tick);
            if let Ok(json) = serde_json::to_string(&record) {
                if let Err(e) = store.set_ex(&format!("last_tick:{}", tick.token), &json, 5).await {
                    log::warn!("failed to persist last_tick:{} to shared store: {e}", tick.token);
                }
            }
        }
    }

    /// Local tier first, then the shared store.
    pub async fn get_or_shared(&self, store: Option<&SharedStore>, token: u32) -> Option<f64> {
        if let Some(price) = self.get(token) {
            return Some(price);
        }
        let store = store?;
        let raw = store.get(&format!("last_tick:{token}")).await.ok().flatten()?;
        let record: LastTickRecord = serde_json::from_str(&raw).ok()?;
        Some(record.last_price)
    }
}

impl Default for LtpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_prices() {
        let cache = LtpCache::new();
        cache.set(1, -5.0);
        cache.set(1, f64::NAN);
        cache.set(1, 0.0);
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn evicts_oldest_over_capacity() {
        let cache = LtpCache::with_capacity(2);
        cache.set(1, 10.0);
        cache.set(2, 20.0);
        cache.set(3, 30.0);
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(20.0));
        assert_eq!(cache.get(3), Some(30.0));
    }

    #[test]
    fn stale_within_reads_do_not_reorder_or_delete() {
        let cache = LtpCache::with_capacity(1);
        cache.set(1, 10.0);
        assert_eq!(cache.get_stale_within(1, Duration::from_secs(5)), Some(10.0));
        assert_eq!(cache.get(1), Some(10.0));
    }
}
