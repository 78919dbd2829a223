//! # Origin Audit Sink
//!
//! Buffers request/event provenance in memory and flushes it to the
//! relational store in small batches rather than writing on every request —
//! the write path never blocks a client on a database round-trip.

use std::sync::Arc;
use std::time::Duration;

use lib_common::connections::Database;
use lib_common::model::{AuditEvent, AuditKind};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::Config;
use crate::metrics;

const RING_CAPACITY: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_CHUNK: usize = 100;
const RETENTION_SWEEP_SCHEDULE: &str = "0 0 3 * * *";

pub struct AuditSink {
    db: Arc<Database>,
    buffer: Mutex<Vec<AuditEvent>>,
    http_sample_rate: f64,
    http_always_log_errors: bool,
    ws_sub_sample_rate: f64,
    retention_days: i64,
}

impl AuditSink {
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            db,
            buffer: Mutex::new(Vec::with_capacity(RING_CAPACITY)),
            http_sample_rate: config.audit_http_sample_rate,
            http_always_log_errors: config.audit_http_always_log_errors,
            ws_sub_sample_rate: config.audit_ws_sub_sample_rate,
            retention_days: config.audit_log_retention_days,
        }
    }

    async fn push(&self, event: AuditEvent) {
        let mut buffer = self.buffer.lock().await;
        if buffer.len() >= RING_CAPACITY {
            buffer.remove(0);
        }
        buffer.push(event);
    }

    /// Samples an HTTP request per the configured rate, always logging
    /// non-2xx responses regardless of the sample.
    pub async fn record_http(
        &self,
        route: &str,
        method: &str,
        status: u16,
        api_key: Option<String>,
        ip: Option<String>,
        user_agent: Option<String>,
        duration_ms: u64,
    ) {
        let is_error = !(200..300).contains(&status);
        let sampled = is_error && self.http_always_log_errors
            || rand::random::<f64>() < self.http_sample_rate;
        if !sampled {
            return;
        }
        self.push(AuditEvent {
            kind: AuditKind::Http,
            route_or_event: route.to_string(),
            method: Some(method.to_string()),
            status: Some(status),
            api_key,
            tenant_id: None,
            ip,
            user_agent,
            origin: None,
            duration_ms: Some(duration_ms),
            meta: None,
            ts: chrono::Utc::now(),
        })
        .await;
    }

    /// `connect`/`disconnect` are always logged; `subscribe`/`unsubscribe`
    /// churn is sampled since it can be far higher volume.
    pub async fn record_ws(
        &self,
        event: &str,
        api_key: Option<String>,
        ip: Option<String>,
        meta: Option<serde_json::Value>,
    ) {
        let always = matches!(event, "connect" | "disconnect");
        let sampled = always || rand::random::<f64>() < self.ws_sub_sample_rate;
        if !sampled {
            return;
        }
        self.push(AuditEvent {
            kind: AuditKind::Ws,
            route_or_event: event.to_string(),
            method: None,
            status: None,
            api_key,
            tenant_id: None,
            ip,
            user_agent: None,
            origin: None,
            duration_ms: None,
            meta,
            ts: chrono::Utc::now(),
        })
        .await;
    }

    async fn flush_once(&self) {
        let batch: Vec<AuditEvent> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            let take = buffer.len().min(FLUSH_CHUNK);
            buffer.drain(..take).collect()
        };
        let rows = batch.len() as u64;
        if let Err(e) = self.db.insert_audit_batch(&batch).await {
            log::warn!("audit flush failed, re-queueing {rows} rows: {e}");
            let mut buffer = self.buffer.lock().await;
            let mut requeued = batch;
            requeued.extend(buffer.drain(..));
            *buffer = requeued;
            metrics::record_audit_flush(0, true);
            return;
        }
        metrics::record_audit_flush(rows, false);
    }

    async fn sweep_retention(&self) {
        match self.db.delete_audit_older_than(self.retention_days).await {
            Ok(deleted) => {
                if deleted > 0 {
                    log::info!("audit retention sweep deleted {deleted} rows older than {} days", self.retention_days);
                }
            }
            Err(e) => log::warn!("audit retention sweep failed: {e}"),
        }
    }

    /// Spawns the 1 s flush loop directly (too fine-grained for a cron
    /// expression) and registers the daily retention sweep with a cron
    /// scheduler; the returned `JobScheduler` must be kept alive.
    pub async fn spawn(self: Arc<Self>) -> anyhow::Result<JobScheduler> {
        let flusher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                flusher.flush_once().await;
            }
        });

        let scheduler = JobScheduler::new().await?;
        let sweeper = self;
        let job = Job::new_async(RETENTION_SWEEP_SCHEDULE, move |_uuid, _lock| {
            let sweeper = sweeper.clone();
            Box::pin(async move { sweeper.sweep_retention().await })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        Ok(scheduler)
    }
}
