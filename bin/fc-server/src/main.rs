//! fc-server: LLM gateway HTTP entry point.
//!
//! Wires the channel store, load balancer, cooldown cache, failover engine,
//! metrics registry, request log store, and upstream client into a
//! [`fc_scheduler::Scheduler`], then serves the ingress and admin routes over
//! axum. Background reapers/pollers/watchers all share one
//! `broadcast::Sender<()>` shutdown signal, matching the donor's
//! manager-loop shutdown idiom generalized from a single `oneshot` to a
//! fan-out broadcast.

mod admin;
mod api;
mod converter;
mod error;
mod ingress;
mod state;
mod user_agent;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fc_channels::{ChannelStore, CooldownConfig, DbChannelStore, FileChannelStore, KeyCooldownCache, LoadBalancer};
use fc_config::AppConfig;
use fc_failover::{ErrorParserConfig, FailoverEngine};
use fc_metrics::{MetricsConfig, MetricsRegistry};
use fc_requestlog::{PostgresRequestLogStore, RequestLogStore, SqliteRequestLogStore};
use fc_scheduler::{ReqwestUpstream, Scheduler};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    fc_common::logging::init_logging("fc-server");

    let config = AppConfig::load()?;
    info!(backend = %config.store.backend, port = config.http.port, "starting fc-server");

    std::fs::create_dir_all(&config.data_dir).ok();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cooldown = Arc::new(KeyCooldownCache::new(CooldownConfig {
        base_window: Duration::from_secs(config.failover.key_cooldown_base_window_seconds),
        max_failure_count: config.failover.key_cooldown_max_failure_count,
    }));
    let cooldown_reaper = fc_channels::spawn_cooldown_reaper(cooldown.clone(), shutdown_tx.clone());

    let load_balancer = Arc::new(LoadBalancer::new(cooldown.clone()));

    let (channels, channel_watcher): (Arc<dyn ChannelStore>, Option<tokio::task::JoinHandle<()>>) =
        if config.store.backend == "file" {
            let store = Arc::new(FileChannelStore::open(&config.store.file_path, config.store.backup_count)?);
            let _watcher = store.spawn_watcher().ok();
            // Leaked intentionally: the watcher must outlive `main` and has no
            // shutdown signal of its own (see DESIGN.md).
            if let Some(w) = _watcher {
                std::mem::forget(w);
            }
            (store as Arc<dyn ChannelStore>, None)
        } else {
            let store = Arc::new(DbChannelStore::connect(&config.store.database_url).await?);
            let handle = store.spawn_poller(Duration::from_millis(config.store.poll_interval_ms), shutdown_tx.clone());
            (store as Arc<dyn ChannelStore>, Some(handle))
        };

    let initial_rules = channels.snapshot().await?.failover.rules;
    let failover = Arc::new(FailoverEngine::new(initial_rules));

    let metrics = Arc::new(MetricsRegistry::new(MetricsConfig {
        window_size: config.failover.circuit_window_size,
        failure_threshold: config.failover.circuit_failure_threshold,
        circuit_recovery: Duration::from_secs(config.failover.circuit_recovery_seconds),
    }));
    let metrics_reaper = metrics.spawn_recovery_reaper(shutdown_tx.clone());

    let (request_log, request_log_listener): (Arc<dyn RequestLogStore>, Option<tokio::task::JoinHandle<()>>) =
        if config.store.backend == "file" {
            let sqlite_path = format!("{}/request_log.db", config.data_dir.trim_end_matches('/'));
            let url = format!("sqlite://{sqlite_path}?mode=rwc");
            let store = Arc::new(SqliteRequestLogStore::connect(&url, config.request_log.max_subscribers).await?);
            (store as Arc<dyn RequestLogStore>, None)
        } else {
            let store = Arc::new(
                PostgresRequestLogStore::connect(&config.store.database_url, config.request_log.max_subscribers).await?,
            );
            let handle = store.spawn_listener(shutdown_tx.clone());
            (store as Arc<dyn RequestLogStore>, Some(handle))
        };

    let upstream = Arc::new(ReqwestUpstream::new(reqwest::Client::new()));

    let error_parser_config = ErrorParserConfig {
        generic_resource_wait_seconds: config.failover.generic_resource_wait_seconds,
        model_cooldown_extra_seconds: config.failover.model_cooldown_extra_seconds,
        model_cooldown_max_wait_seconds: config.failover.model_cooldown_max_wait_seconds,
    };

    let scheduler = Arc::new(Scheduler::new(
        channels.clone(),
        load_balancer.clone(),
        failover.clone(),
        metrics.clone(),
        request_log.clone(),
        upstream.clone(),
        error_parser_config,
    ));

    let state = AppState {
        channels,
        load_balancer,
        cooldown,
        failover,
        metrics,
        request_log,
        scheduler,
        user_agent_defaults: config.user_agent.clone(),
    };

    let cors_origins: Vec<axum::http::HeaderValue> =
        config.http.cors_origins.iter().filter_map(|origin| origin.parse().ok()).collect();
    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let app = api::create_router(state).layer(TraceLayer::new_for_http()).layer(cors);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    server_task.abort();

    for handle in [Some(cooldown_reaper), channel_watcher, Some(metrics_reaper), request_log_listener]
        .into_iter()
        .flatten()
    {
        if tokio::time::timeout(Duration::from_secs(30), handle).await.is_err() {
            warn!("background task did not complete within 30s timeout");
        }
    }

    info!("fc-server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
