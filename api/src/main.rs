pub mod helpers;
pub mod routes;
pub mod types;

use axum_governor::GovernorLayer;
use bench_core::constants::COMPUTE_STATS_TOPIC;
use log::{error, info, warn, LevelFilter};
use real::RealIpLayer;
use server::clock::{Clock, SystemClock};
use server::config::ServerConfig;
use server::keydb_store::KeyDbStore;
use server::kv::KvStore;
use server::listener::QueueListener;
use server::scheduler::Scheduler;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn resolve_log_level() -> LevelFilter {
    env::var("API_LOG_LEVEL")
        .ok()
        .as_deref()
        .and_then(bench_core::parse_log_level)
        .unwrap_or(LevelFilter::Info)
}

fn resolve_log_file() -> Option<String> {
    match env::var("API_LOG_FILE") {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => Some("api.log".to_string()),
    }
}

fn resolve_api_bind_addr() -> String {
    env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn resolve_api_port() -> u16 {
    env::var("API_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(5554)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let log_level = resolve_log_level();
    let log_file = resolve_log_file();
    bench_core::initialize_logger(log_level, log_file.as_deref())?;

    info!(
        "API starting (level={}, logfile={})",
        log_level,
        log_file.as_deref().unwrap_or("none")
    );

    let config = ServerConfig::from_env()?;

    lazy_limit::initialize_limiter(helpers::limiter_config(config.rate_limit_per_sec)).await;
    info!(
        "Rate limiter initialized: {} req/s, {} at 1 req/s",
        config.rate_limit_per_sec,
        routes::RECOMPUTE_ROUTE
    );
    if config.stats_token.is_none() {
        warn!("STATS_TOKEN is not set; manual recompute is disabled");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn KvStore> = Arc::new(
        KeyDbStore::connect(
            &config.keydb_url,
            config.keydb_replica_url.as_deref(),
            config.queue,
            clock.clone(),
        )
        .await?,
    );
    info!(
        "Connected to KeyDB (replica={})",
        config.keydb_replica_url.as_deref().unwrap_or("none")
    );

    let scheduler = Arc::new(Scheduler::new(
        COMPUTE_STATS_TOPIC,
        store.clone(),
        clock.clone(),
        config.stats_interval,
    ));
    // Serving measurements must not depend on the schedule being healthy.
    match scheduler.startup().await {
        Ok(report) => info!(
            "Scheduler startup: claim={:?}, recovery={:?}",
            report.claim, report.recovery
        ),
        Err(err) => error!("Scheduler startup failed: {}", err),
    }
    let mut listener = QueueListener::spawn(store.clone(), scheduler.clone(), config.poll_interval);

    let state = routes::AppState {
        store,
        scheduler,
        clock,
        config: Arc::new(config),
    };
    let app = routes::router(state)
        .layer(GovernorLayer::default())
        .layer(RealIpLayer::default());

    let bind_address = format!("{}:{}", resolve_api_bind_addr(), resolve_api_port());
    info!("Listening on {}", bind_address);

    let tls_cert = std::env::var("API_TLS_CERT").ok();
    let tls_key = std::env::var("API_TLS_KEY").ok();

    match (tls_cert, tls_key) {
        (Some(cert_path), Some(key_path)) => {
            info!("HTTPS enabled (cert={}, key={})", cert_path, key_path);
            let _ = rustls::crypto::ring::default_provider().install_default();
            let tls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to load TLS cert/key: {e}"))?;
            let addr: SocketAddr = bind_address
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(StdDuration::from_secs(10)));
            });

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        _ => {
            warn!("╔══════════════════════════════════════════════════════════════╗");
            warn!("║  WARNING: API is running WITHOUT TLS encryption!            ║");
            warn!("║  All HTTP traffic is transmitted in plaintext.              ║");
            warn!("║  Set API_TLS_CERT and API_TLS_KEY to enable HTTPS.          ║");
            warn!("╚══════════════════════════════════════════════════════════════╝");
            let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
            axum::serve(
                tcp_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        }
    }

    listener.shutdown().await;
    info!("Server shutdown");
    Ok(())
}
