//! # Metrics Registry
//!
//! Thin wrapper around the process-wide `metrics` recorder: one Prometheus
//! exporter installed at startup, plus a handful of named helper functions
//! so call sites read like what they record instead of raw metric-name
//! strings scattered through the gateway.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus metrics recorder")
}

pub fn record_http_request(route: &'static str, status: u16) {
    metrics::counter!("gateway_http_requests_total", "route" => route, "status" => status.to_string()).increment(1);
}

pub fn record_ws_event(event: &'static str) {
    metrics::counter!("gateway_ws_events_total", "event" => event).increment(1);
}

pub fn record_ws_connection_opened() {
    metrics::gauge!("gateway_ws_connections_active").increment(1.0);
}

pub fn record_ws_connection_closed() {
    metrics::gauge!("gateway_ws_connections_active").decrement(1.0);
}

pub fn record_ws_backpressure_drop() {
    metrics::counter!("gateway_ws_backpressure_drops_total").increment(1);
}

pub fn record_provider_call(provider: &'static str, endpoint: &'static str, ok: bool) {
    metrics::counter!(
        "gateway_provider_calls_total",
        "provider" => provider,
        "endpoint" => endpoint,
        "result" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    metrics::counter!("gateway_ltp_cache_lookups_total", "hit" => hit.to_string()).increment(1);
}

pub fn record_batch_request(dedup_savings: u64) {
    metrics::counter!("gateway_batcher_requests_total").increment(1);
    metrics::counter!("gateway_batcher_dedup_savings_total").increment(dedup_savings);
}

pub fn record_abuse_scan(flagged: u64) {
    metrics::counter!("gateway_abuse_scans_total").increment(1);
    metrics::gauge!("gateway_abuse_flagged_keys").set(flagged as f64);
}

pub fn record_audit_flush(rows: u64, failed: bool) {
    metrics::counter!("gateway_audit_rows_flushed_total").increment(rows);
    if failed {
        metrics::counter!("gateway_audit_flush_failures_total").increment(1);
    }
}
