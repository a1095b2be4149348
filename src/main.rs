//! DLN Order Indexer
//!
//! Off-chain service that scans the DLN source and destination programs on
//! Solana, enriches created and fulfilled orders with USD values, and
//! persists them into ClickHouse for volume analytics.
//!
//! Runs three concurrent subsystems:
//!
//! - **Source scanner** — bidirectional signature scan of the source program
//!   for `CreatedOrder` events.
//! - **Destination scanner** — the same loop over the destination program
//!   for `Fulfilled` events.
//! - **HTTP server** — liveness (`/health`), readiness (`/status`),
//!   `/metrics`, and the volume read routes backing the dashboard.

use actix_web::{App, HttpResponse, HttpServer, web};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod analytics;
mod checkpoint;
mod config;
mod events;
mod fulfillment;
mod metrics;
mod order;
mod pricing;
mod rpc;
mod scanner;

use analytics::{AnalyticsSink, ClickHouseSink, VolumeFilter};
use checkpoint::{CheckpointStore, CoalescedCheckpoints, RedisCheckpointStore};
use config::AppConfig;
use fulfillment::{FulfillmentResolver, UsdPricer};
use metrics::{Metrics, RpcMetrics, spawn_rpc_window_logger};
use order::OrderKind;
use pricing::PriceOracle;
use rpc::{ChainApi, RateLimitedChainClient};
use scanner::{OrderPricer, Scanner, ScannerContext};

/// Shared application state accessible from HTTP handlers.
struct AppState {
    metrics: Arc<Metrics>,
    rpc_metrics: Arc<RpcMetrics>,
    sink: Arc<dyn AnalyticsSink>,
}

/// Liveness probe — returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness / status probe — reports indexing progress.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "indexing": data.metrics.to_json(),
    }))
}

/// Metrics endpoint — returns JSON counters for monitoring.
async fn metrics_handler(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "indexing": data.metrics.to_json(),
        "rpc_window": data.rpc_metrics.to_json(),
    }))
}

#[derive(serde::Deserialize)]
struct VolumeQuery {
    event_type: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

/// Daily order counts and USD volumes from the rollup.
async fn daily_volumes(data: web::Data<AppState>, query: web::Query<VolumeQuery>) -> HttpResponse {
    let event_type = match query.event_type.as_deref() {
        None => None,
        Some("created") => Some(OrderKind::Created),
        Some("fulfilled") => Some(OrderKind::Fulfilled),
        Some(other) => {
            return HttpResponse::BadRequest()
                .json(serde_json::json!({"error": format!("unknown event_type: {other}")}));
        }
    };

    let filter = VolumeFilter {
        event_type,
        from: query.from.clone(),
        to: query.to.clone(),
    };
    match data.sink.daily_volume(&filter).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => {
            error!(error = %e, "Daily volume query failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({"error": "volume query failed"}))
        }
    }
}

/// Stored min/max dates for default dashboard bounds.
async fn volume_range(data: web::Data<AppState>) -> HttpResponse {
    match data.sink.default_range().await {
        Ok(range) => HttpResponse::Ok().json(range),
        Err(e) => {
            error!(error = %e, "Range query failed");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({"error": "range query failed"}))
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{default_level},solana_client=warn,solana_rpc_client=warn,hyper=warn,reqwest=warn"
            ))
        }))
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    info!(
        src = %config.src_program,
        dst = %config.dst_program,
        "Starting DLN indexer"
    );
    info!(
        rpc = %config.rpc_url,
        clickhouse = %config.clickhouse_host,
        redis = %config.redis_url,
        "Endpoints configured"
    );
    info!(
        port = config.http_port,
        rps = config.rps,
        batch_size = config.batch_size,
        delay_ms = config.delay_ms,
        "Indexer configuration"
    );

    let metrics = Arc::new(Metrics::new());
    let rpc_metrics = Arc::new(RpcMetrics::new());
    let rpc_window_logger = spawn_rpc_window_logger(rpc_metrics.clone());

    let chain: Arc<dyn ChainApi> = Arc::new(RateLimitedChainClient::new(
        config.rpc_url.clone(),
        config.rps,
        rpc_metrics.clone(),
    ));

    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("invalid REDIS_URL");
    let redis_con = redis_client
        .get_multiplexed_tokio_connection()
        .await
        .expect("failed to connect to redis");

    let oracle = Arc::new(PriceOracle::new(
        config::JUPITER_PRICE_URL.to_string(),
        config.jupiter_api_key.clone(),
        Some(redis_con.clone()),
        chain.clone(),
    ));
    let resolver = FulfillmentResolver::new(config::DLN_API_URL.to_string(), oracle.clone());
    let pricer: Arc<dyn OrderPricer> = Arc::new(UsdPricer::new(oracle, resolver));

    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(CoalescedCheckpoints::new(Arc::new(
        RedisCheckpointStore::new(redis_con),
    )));
    let sink: Arc<dyn AnalyticsSink> = Arc::new(ClickHouseSink::new(
        config.clickhouse_host.clone(),
        config.clickhouse_database.clone(),
        config.clickhouse_user.clone(),
        config.clickhouse_password.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let ctx = ScannerContext {
        chain,
        pricer,
        checkpoints: checkpoints.clone(),
        sink: sink.clone(),
        metrics: metrics.clone(),
    };
    let delay = Duration::from_millis(config.delay_ms);

    let src_scanner = Scanner::new(
        "src",
        config.src_program,
        OrderKind::Created,
        ctx.clone(),
        config.batch_size,
        delay,
        stop_rx.clone(),
    );
    let dst_scanner = Scanner::new(
        "dst",
        config.dst_program,
        OrderKind::Fulfilled,
        ctx,
        config.batch_size,
        delay,
        stop_rx,
    );

    let src_handle = tokio::spawn(src_scanner.run());
    let dst_handle = tokio::spawn(dst_scanner.run());

    let state = web::Data::new(AppState {
        metrics: metrics.clone(),
        rpc_metrics: rpc_metrics.clone(),
        sink: sink.clone(),
    });

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    info!(addr = %bind_addr, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/volumes/daily", web::get().to(daily_volumes))
            .route("/volumes/range", web::get().to(volume_range))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();

    // Graceful shutdown on SIGINT / SIGTERM.
    {
        let stop_tx = stop_tx.clone();
        let server_handle = server_handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal, stopping scanners");
            let _ = stop_tx.send(true);
            server_handle.stop(true).await;
        });
    }

    // Optional stop predicate: exit once both order kinds reach the target.
    if let Some(target) = config.target_orders {
        let sink = sink.clone();
        let stop_tx = stop_tx.clone();
        let server_handle = server_handle.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                let created = match sink.order_count(OrderKind::Created).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "Order count check failed");
                        continue;
                    }
                };
                let fulfilled = match sink.order_count(OrderKind::Fulfilled).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "Order count check failed");
                        continue;
                    }
                };
                if created >= target && fulfilled >= target {
                    info!(created, fulfilled, target, "Order target reached, stopping");
                    let _ = stop_tx.send(true);
                    server_handle.stop(true).await;
                    break;
                }
            }
        });
    }

    // Run until the server stops.
    let result = server.await;

    // Let the scanners finish their current signature, then close the sink
    // and the checkpoint store (flushing any pending window).
    let _ = stop_tx.send(true);
    let (src_result, dst_result) = futures_util::future::join(src_handle, dst_handle).await;
    if src_result.is_err() {
        error!("Source scanner task panicked");
    }
    if dst_result.is_err() {
        error!("Destination scanner task panicked");
    }
    rpc_window_logger.abort();

    if let Err(e) = sink.close().await {
        error!(error = %e, "Failed to close analytics sink");
    }
    if let Err(e) = checkpoints.close().await {
        error!(error = %e, "Failed to close checkpoint store");
    }

    info!("DLN indexer stopped");
    result
}
