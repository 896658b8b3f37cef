//! Search Key Broker
//!
//! Single-binary service that hands out search API keys from a shared,
//! usage-balanced pool:
//! 1. Loads the key store (JSON file, SQLite or in-memory) and runs the monthly reset check
//! 2. Serves `POST /v1/keys/acquire`, `/health` and `/metrics` on the main listener
//! 3. Serves key provisioning and reset endpoints on a separate admin listener
//! 4. Falls back to a key from the environment when the pool cannot serve

mod acquire;
mod admin;
mod config;
mod error;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use key_pool::{FallbackResolver, LocalClock, PoolManager, ResetCheck, spawn_reset_task};
use key_store::{FileStore, KeyStore, MemoryStore, SqliteStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, StoreBackend, StoreConfig};

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<PoolManager>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the main axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`; excess
/// requests queue rather than fail.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/keys/acquire", post(acquire_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Construct the configured key store backend.
async fn build_store(config: &StoreConfig) -> Result<Arc<dyn KeyStore>> {
    match config.backend {
        StoreBackend::File => {
            let path = config
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            info!(path = %path.display(), "using file key store");
            Ok(Arc::new(FileStore::new(path)))
        }
        StoreBackend::Sqlite => {
            let url = config
                .url
                .as_deref()
                .context("store.url is required for the sqlite backend")?;
            let store = SqliteStore::connect(url)
                .await
                .context("failed to open sqlite key store")?;
            info!("using sqlite key store");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory key store, usage counts will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Start the background reset timer when the pool runs interval checks.
fn spawn_background_reset(pool: &Arc<PoolManager>) -> Option<tokio::task::JoinHandle<()>> {
    match pool.reset_check() {
        ResetCheck::Interval(every) => {
            info!(interval_secs = every.as_secs(), "starting background reset check");
            Some(spawn_reset_task(pool.clone(), every))
        }
        ResetCheck::Startup | ResetCheck::EveryAcquire => None,
    }
}

/// Spawn a server task that drains once `shutdown_rx` fires.
fn serve(
    listener_name: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<error::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|source| error::Error::Serve {
                listener: listener_name,
                source,
            })
    })
}

async fn bind(listener: &'static str, addr: std::net::SocketAddr) -> error::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| error::Error::Bind {
            listener,
            addr,
            source,
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting search-key-broker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let reset_check = config
        .pool
        .reset_check()
        .context("invalid pool.reset_check")?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        backend = ?config.store.backend,
        fallback_env = %config.pool.fallback_env,
        %reset_check,
        "configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let fallback = FallbackResolver::from_env(&config.pool.fallback_env);
    let pool = Arc::new(
        PoolManager::start(store, fallback, reset_check, Arc::new(LocalClock)).await,
    );
    if let key_pool::ManagerState::Degraded { reason } = pool.state() {
        warn!(%reason, "key pool started degraded, serving fallback key when possible");
    }

    let reset_task = spawn_background_reset(&pool);

    let app_state = AppState {
        pool: pool.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool));

    let listener = bind("main", config.server.listen_addr).await?;
    let admin_listener = bind("admin", config.server.admin_addr).await?;
    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // The drain timeout starts when the shutdown signal fires, not when the
    // servers start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = serve("main", listener, app, shutdown_rx);
    let admin_handle = serve("admin", admin_listener, admin_app, admin_shutdown_rx);

    shutdown_signal().await;

    if let Some(task) = reset_task {
        task.abort();
    }
    let _ = shutdown_tx.send(());
    let _ = admin_shutdown_tx.send(());

    let drained = async {
        let (main, admin) = tokio::join!(server_handle, admin_handle);
        for joined in [main, admin] {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
        }
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, drained).await {
        Ok(()) => info!("all in-flight requests drained"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Hand out one key from the pool (or the fallback).
async fn acquire_handler(State(state): State<AppState>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    acquire::acquire_key(&state.pool, request_id).await
}

/// Health endpoint: pool summary plus uptime.
/// Returns 200 while a key can be served (pool or fallback), 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health().await;
    body["uptime_seconds"] = serde_json::Value::from(state.started_at.elapsed().as_secs());

    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
