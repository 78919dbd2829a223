//! Per-socket outbound channels, the handle the stream multiplexer uses to
//! reach individual WebSocket clients without holding a reference back to
//! the WS gateway itself — this is what keeps the F↔G dependency one-way:
//! G registers a channel here when a socket connects, F only ever talks to
//! the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

pub type ClientId = u64;

/// Bounds each socket's outbound queue; a socket that can't keep up has its
/// frames dropped rather than growing the queue without bound. At typical
/// tick-frame sizes this approximates the ~16 MiB per-socket guard without
/// tracking raw byte counts on every send.
const CLIENT_CHANNEL_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    Connected {
        client_id: ClientId,
    },
    SubscriptionConfirmed {
        instruments: Vec<String>,
        mode: String,
    },
    UnsubscriptionConfirmed {
        instruments: Vec<String>,
    },
    ModeConfirmed {
        instruments: Vec<String>,
        mode: String,
    },
    MarketData {
        token: u32,
        data: serde_json::Value,
        ts: i64,
    },
    QuoteData {
        data: serde_json::Value,
    },
    HistoricalData {
        token: u32,
        data: serde_json::Value,
    },
    Pong {
        ts: i64,
    },
    StreamStatus {
        status: String,
    },
    Error {
        code: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        risk_score: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasons: Option<Vec<String>>,
    },
}

pub struct ClientRegistry {
    next_id: AtomicU64,
    senders: Mutex<HashMap<ClientId, mpsc::Sender<OutboundEvent>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, id: ClientId) -> mpsc::Receiver<OutboundEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        self.senders.lock().unwrap().insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: ClientId) {
        self.senders.lock().unwrap().remove(&id);
    }

    /// Best-effort send; a full queue counts as a backpressure drop rather
    /// than blocking the broadcaster on one slow socket.
    pub fn try_send(&self, id: ClientId, event: OutboundEvent) -> bool {
        let senders = self.senders.lock().unwrap();
        match senders.get(&id) {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
