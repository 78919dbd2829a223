//! PostgreSQL-backed relational store: `api_keys`, `instruments`,
//! `vortex_instruments`, `request_audit_logs`, `api_key_abuse_flags`.
//!
//! This module owns the schema's query surface; the tables themselves are
//! the external collaborator named in the system overview, not something
//! this crate provisions.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::model::{AbuseFlag, ApiKeyRecord, AuditEvent, AuditKind};

/// A wrapper around the PostgreSQL connection pool. `PgPool` is an `Arc`
/// internally, so cloning this just shares the pool.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Creates a new connection pool for the specified database URL.
    pub async fn new(database_url: &str, max_connections: u32) -> sqlx::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> sqlx::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Reads one api-key row, if it exists.
    pub async fn get_api_key(&self, key: &str) -> sqlx::Result<Option<ApiKeyRecord>> {
        let row = sqlx::query(
            "SELECT key, tenant_id, is_active, provider_override, rate_limit_per_minute, \
             connection_limit, ws_subscribe_rps, ws_unsubscribe_rps, ws_mode_rps, \
             entitled_exchanges \
             FROM api_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ApiKeyRecord {
            key: row.get("key"),
            tenant_id: row.get("tenant_id"),
            is_active: row.get("is_active"),
            provider_override: row.get("provider_override"),
            rate_limit_per_minute: row.get::<i32, _>("rate_limit_per_minute") as u32,
            connection_limit: row.get::<i32, _>("connection_limit") as u32,
            ws_subscribe_rps: row
                .get::<Option<i32>, _>("ws_subscribe_rps")
                .map(|v| v as u32),
            ws_unsubscribe_rps: row
                .get::<Option<i32>, _>("ws_unsubscribe_rps")
                .map(|v| v as u32),
            ws_mode_rps: row.get::<Option<i32>, _>("ws_mode_rps").map(|v| v as u32),
            entitled_exchanges: row.get("entitled_exchanges"),
        }))
    }

    pub async fn upsert_api_key(&self, rec: &ApiKeyRecord) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (key, tenant_id, is_active, provider_override, \
             rate_limit_per_minute, connection_limit, ws_subscribe_rps, ws_unsubscribe_rps, \
             ws_mode_rps, entitled_exchanges) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (key) DO UPDATE SET \
               tenant_id = EXCLUDED.tenant_id, \
               is_active = EXCLUDED.is_active, \
               provider_override = EXCLUDED.provider_override, \
               rate_limit_per_minute = EXCLUDED.rate_limit_per_minute, \
               connection_limit = EXCLUDED.connection_limit, \
               ws_subscribe_rps = EXCLUDED.ws_subscribe_rps, \
               ws_unsubscribe_rps = EXCLUDED.ws_unsubscribe_rps, \
               ws_mode_rps = EXCLUDED.ws_mode_rps, \
               entitled_exchanges = EXCLUDED.entitled_exchanges",
        )
        .bind(&rec.key)
        .bind(&rec.tenant_id)
        .bind(rec.is_active)
        .bind(&rec.provider_override)
        .bind(rec.rate_limit_per_minute as i32)
        .bind(rec.connection_limit as i32)
        .bind(rec.ws_subscribe_rps.map(|v| v as i32))
        .bind(rec.ws_unsubscribe_rps.map(|v| v as i32))
        .bind(rec.ws_mode_rps.map(|v| v as i32))
        .bind(&rec.entitled_exchanges)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Looks up the authoritative exchange segment for a token from the
    /// instrument table, falling back to `vortex_instruments`.
    pub async fn resolve_exchange(&self, token: u32) -> sqlx::Result<Option<String>> {
        if let Some(row) = sqlx::query("SELECT exchange FROM instruments WHERE token = $1")
            .bind(token as i64)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(row.get("exchange")));
        }
        if let Some(row) =
            sqlx::query("SELECT exchange FROM vortex_instruments WHERE token = $1")
                .bind(token as i64)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(Some(row.get("exchange")));
        }
        Ok(None)
    }

    /// Appends a batch of audit rows; used by the origin audit sink's flush.
    pub async fn insert_audit_batch(&self, events: &[AuditEvent]) -> sqlx::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for ev in events {
            sqlx::query(
                "INSERT INTO request_audit_logs \
                 (kind, route_or_event, method, status, api_key, tenant_id, ip, user_agent, \
                  origin, duration_ms, meta, ts) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
            )
            .bind(match ev.kind {
                AuditKind::Http => "http",
                AuditKind::Ws => "ws",
            })
            .bind(&ev.route_or_event)
            .bind(&ev.method)
            .bind(ev.status.map(|s| s as i32))
            .bind(&ev.api_key)
            .bind(&ev.tenant_id)
            .bind(&ev.ip)
            .bind(&ev.user_agent)
            .bind(&ev.origin)
            .bind(ev.duration_ms.map(|d| d as i64))
            .bind(&ev.meta)
            .bind(ev.ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Per-key `(total_requests, unique_ips)` over the trailing window, for
    /// the abuse detector's periodic scan.
    pub async fn audit_window_aggregates(
        &self,
        window_minutes: i64,
    ) -> sqlx::Result<Vec<(String, i64, i64)>> {
        let rows = sqlx::query(
            "SELECT api_key, COUNT(*) AS total_requests, COUNT(DISTINCT ip) AS unique_ips \
             FROM request_audit_logs \
             WHERE ts >= NOW() - ($1 || ' minutes')::interval AND api_key IS NOT NULL \
             GROUP BY api_key",
        )
        .bind(window_minutes.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("api_key"),
                    row.get("total_requests"),
                    row.get("unique_ips"),
                )
            })
            .collect())
    }

    pub async fn delete_audit_older_than(&self, days: i64) -> sqlx::Result<u64> {
        let result =
            sqlx::query("DELETE FROM request_audit_logs WHERE ts < NOW() - ($1 || ' days')::interval")
                .bind(days.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_abuse_flag(&self, api_key: &str) -> sqlx::Result<Option<AbuseFlag>> {
        let row = sqlx::query(
            "SELECT api_key, risk_score, reason_codes, blocked, last_seen_at \
             FROM api_key_abuse_flags WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AbuseFlag {
            api_key: row.get("api_key"),
            risk_score: row.get("risk_score"),
            reason_codes: row.get("reason_codes"),
            blocked: row.get("blocked"),
            last_seen_at: row.get("last_seen_at"),
        }))
    }

    pub async fn upsert_abuse_flag(&self, flag: &AbuseFlag) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO api_key_abuse_flags (api_key, risk_score, reason_codes, blocked, last_seen_at) \
             VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT (api_key) DO UPDATE SET \
               risk_score = EXCLUDED.risk_score, \
               reason_codes = EXCLUDED.reason_codes, \
               blocked = EXCLUDED.blocked, \
               last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(&flag.api_key)
        .bind(flag.risk_score)
        .bind(&flag.reason_codes)
        .bind(flag.blocked)
        .bind(flag.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Partial update of an existing key's limits; `None` fields are left
    /// untouched via `COALESCE` rather than overwritten, so an admin can
    /// bump a single limit without resending the whole record.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_api_key_limits(
        &self,
        key: &str,
        rate_limit_per_minute: Option<u32>,
        connection_limit: Option<u32>,
        ws_subscribe_rps: Option<u32>,
        ws_unsubscribe_rps: Option<u32>,
        ws_mode_rps: Option<u32>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET \
               rate_limit_per_minute = COALESCE($2, rate_limit_per_minute), \
               connection_limit = COALESCE($3, connection_limit), \
               ws_subscribe_rps = COALESCE($4, ws_subscribe_rps), \
               ws_unsubscribe_rps = COALESCE($5, ws_unsubscribe_rps), \
               ws_mode_rps = COALESCE($6, ws_mode_rps) \
             WHERE key = $1",
        )
        .bind(key)
        .bind(rate_limit_per_minute.map(|v| v as i32))
        .bind(connection_limit.map(|v| v as i32))
        .bind(ws_subscribe_rps.map(|v| v as i32))
        .bind(ws_unsubscribe_rps.map(|v| v as i32))
        .bind(ws_mode_rps.map(|v| v as i32))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces a key's entitled-exchange allowlist wholesale; `None` clears
    /// it back to "all exchanges entitled".
    pub async fn set_entitled_exchanges(&self, key: &str, exchanges: Option<Vec<String>>) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE api_keys SET entitled_exchanges = $2 WHERE key = $1")
            .bind(key)
            .bind(exchanges)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_abuse_flags(&self) -> sqlx::Result<Vec<AbuseFlag>> {
        let rows = sqlx::query(
            "SELECT api_key, risk_score, reason_codes, blocked, last_seen_at \
             FROM api_key_abuse_flags ORDER BY last_seen_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AbuseFlag {
                api_key: row.get("api_key"),
                risk_score: row.get("risk_score"),
                reason_codes: row.get("reason_codes"),
                blocked: row.get("blocked"),
                last_seen_at: row.get("last_seen_at"),
            })
            .collect())
    }
}
