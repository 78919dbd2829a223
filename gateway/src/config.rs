//! Runtime configuration: CLI flags with environment-variable fallbacks,
//! mirroring the single-`Config`-struct-via-clap shape used elsewhere in
//! this workspace, generalized to the gateway's larger surface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Config {
    #[clap(long, env = "GATEWAY_PORT", default_value = "8080")]
    pub port: u16,

    #[clap(long, env = "GATEWAY_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    #[clap(long, env = "DATABASE_URL", default_value = "postgres://localhost/gateway")]
    pub database_url: String,

    #[clap(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "10")]
    pub database_max_connections: u32,

    #[clap(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/")]
    pub redis_url: String,

    /// Active broker provider at boot; `F` or `V`. Can be changed later via
    /// `POST /admin/provider/global`.
    #[clap(long, env = "DATA_PROVIDER", default_value = "F")]
    pub data_provider: String,

    #[clap(long, env = "PROVIDER_F_HTTP_BASE_URL", default_value = "https://api.provider-f.example.com")]
    pub provider_f_http_base_url: String,
    #[clap(long, env = "PROVIDER_F_WS_URL", default_value = "wss://feed.provider-f.example.com")]
    pub provider_f_ws_url: String,
    #[clap(long, env = "PROVIDER_F_CLIENT_ID", default_value = "")]
    pub provider_f_client_id: String,
    #[clap(long, env = "PROVIDER_F_ACCESS_TOKEN", default_value = "")]
    pub provider_f_access_token: String,

    #[clap(long, env = "PROVIDER_V_HTTP_BASE_URL", default_value = "https://api.provider-v.example.com")]
    pub provider_v_http_base_url: String,
    #[clap(long, env = "PROVIDER_V_WS_URL", default_value = "wss://feed.provider-v.example.com")]
    pub provider_v_ws_url: String,
    #[clap(long, env = "PROVIDER_V_API_KEY", default_value = "")]
    pub provider_v_api_key: String,

    #[clap(long, env = "ADMIN_TOKEN", default_value = "")]
    pub admin_token: String,

    #[clap(long, env = "WS_SUBSCRIBE_RPS", default_value = "20")]
    pub ws_subscribe_rps: u32,
    #[clap(long, env = "WS_UNSUBSCRIBE_RPS", default_value = "20")]
    pub ws_unsubscribe_rps: u32,
    #[clap(long, env = "WS_MODE_RPS", default_value = "20")]
    pub ws_mode_rps: u32,
    #[clap(long, env = "MAX_SUBSCRIPTIONS_PER_SOCKET", default_value = "1000")]
    pub max_subscriptions_per_socket: usize,

    #[clap(long, env = "ABUSE_WINDOW_MINUTES", default_value = "10")]
    pub abuse_window_minutes: i64,
    #[clap(long, env = "ABUSE_UNIQUE_IP_THRESHOLD", default_value = "20")]
    pub abuse_unique_ip_threshold: i64,
    #[clap(long, env = "ABUSE_TOTAL_REQ_THRESHOLD", default_value = "2000")]
    pub abuse_total_req_threshold: i64,
    #[clap(long, env = "ABUSE_BLOCK_SCORE_THRESHOLD", default_value = "100")]
    pub abuse_block_score_threshold: f64,

    #[clap(long, env = "AUDIT_HTTP_SAMPLE_RATE", default_value = "0.01")]
    pub audit_http_sample_rate: f64,
    #[clap(long, env = "AUDIT_HTTP_ALWAYS_LOG_ERRORS", default_value = "true")]
    pub audit_http_always_log_errors: bool,
    #[clap(long, env = "AUDIT_WS_SUB_SAMPLE_RATE", default_value = "0")]
    pub audit_ws_sub_sample_rate: f64,
    #[clap(long, env = "AUDIT_LOG_RETENTION_DAYS", default_value = "90")]
    pub audit_log_retention_days: i64,
}

pub fn load_config() -> Config {
    let _ = dotenvy::dotenv();
    Config::parse()
}
