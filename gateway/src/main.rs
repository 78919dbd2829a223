use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use gateway::{admin, config, health, logging, metrics, rest, state::AppState, ws};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    logging::setup_logging(&config.log_dir, &config.log_level)?;

    let metrics_handle = metrics::install();
    let app_state = AppState::new(config.clone(), metrics_handle).await?;

    // Kept alive for the lifetime of the process; dropping either scheduler
    // would stop its background job from firing.
    let abuse_scheduler = app_state.abuse.clone().spawn().await?;
    let audit_scheduler = app_state.audit.clone().spawn().await?;

    app_state.multiplexer.start_streaming().await?;

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/market-data", get(ws::ws_handler))
        .route("/quote", get(rest::get_quote))
        .route("/ltp", get(rest::get_ltp))
        .route("/ohlc", get(rest::get_ohlc))
        .route("/admin/provider/global", post(admin::set_global_provider).get(admin::get_global_provider))
        .route("/admin/provider/stream/start", post(admin::start_stream))
        .route("/admin/provider/stream/stop", post(admin::stop_stream))
        .route("/admin/stream/status", get(admin::stream_status))
        .route("/admin/apikeys", post(admin::create_api_key))
        .route("/admin/apikeys/limits", post(admin::update_api_key_limits))
        .route("/admin/apikeys/{key}/usage", get(admin::get_api_key_usage))
        .route("/admin/ws/entitlements", post(admin::set_entitlements))
        .route("/admin/ws/blocklist", post(admin::set_blocklist))
        .route("/admin/abuse/flags", get(admin::list_abuse_flags))
        .route("/admin/abuse/flags/block", post(admin::block_abuse))
        .route("/admin/abuse/flags/unblock", post(admin::unblock_abuse))
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/health/metrics", get(health::health_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("gateway listening on {addr}");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let serve = async {
        if let (Some(cert_path), Some(key_path)) = (config.tls_cert_path.clone(), config.tls_key_path.clone()) {
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .expect("failed to load TLS configuration");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        } else {
            let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                    log::info!("gateway shutting down");
                })
                .await
                .unwrap();
        }
    };
    let serve_handle = tokio::spawn(serve);

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());
    let _ = serve_handle.await;
    drop(abuse_scheduler);
    drop(audit_scheduler);

    log::info!("shutdown complete.");
    Ok(())
}
